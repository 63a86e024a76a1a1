use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

/// Default wire-level ports.
pub const DEFAULT_PLAINTEXT_PORT: u16 = 50050;
pub const DEFAULT_TLS_PORT: u16 = 50051;
pub const DEFAULT_CONNECT_PORT: u16 = 50052;

/// Default bound on waiting for in-flight requests during drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where validation constraints are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationSource {
    /// Accept both PGV and protovalidate annotations, whichever is present.
    #[default]
    Auto,
    /// Only `(validate.rules)` annotations.
    Pgv,
    /// Only `(buf.validate.field)` annotations.
    Protovalidate,
}

/// When streaming validation runs relative to message arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Validate each inbound message as it arrives.
    #[default]
    PerMessage,
    /// Collect the whole client stream, then validate every message.
    Aggregate,
}

/// Settings for the two native gRPC listeners.
#[derive(Debug, Clone)]
pub struct GrpcSettings {
    pub plaintext_port: u16,
    pub tls_port: u16,
    /// Explicit TLS toggle; TLS is also enabled implicitly when both cert
    /// and key paths are present.
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub tls_ca_path: Option<String>,
    pub require_client_cert: bool,
}

impl GrpcSettings {
    /// Whether the TLS listener should be brought up at all.
    pub fn tls_requested(&self) -> bool {
        self.tls_enabled || (self.tls_cert_path.is_some() && self.tls_key_path.is_some())
    }
}

/// Settings for the Connect / gRPC-Web HTTP listener.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub enabled: bool,
    pub port: u16,
    pub tls_enabled: bool,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
    pub cors_methods: Vec<String>,
    pub cors_headers: Vec<String>,
}

/// Settings for the validation runtime.
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub enabled: bool,
    pub source: ValidationSource,
    pub mode: ValidationMode,
    /// Message-level CEL evaluation is gated behind an experimental flag.
    pub cel_message: bool,
}

/// Settings for the hot-reload watchers.
#[derive(Debug, Clone)]
pub struct ReloadSettings {
    pub watch_protos: bool,
    pub watch_rules: bool,
    pub drain_timeout: Duration,
}

/// Complete runtime configuration, derived from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub proto_dir: String,
    pub rules_dir: String,
    pub grpc: GrpcSettings,
    pub connect: ConnectSettings,
    pub validation: ValidationSettings,
    pub reload: ReloadSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from_map(&HashMap::new())
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Settings::from_map(&vars)
    }

    /// Read settings from a key/value view of the environment.
    ///
    /// Unparseable values fall back to their defaults with a warning; a bad
    /// variable must never prevent the server from starting.
    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        Settings {
            proto_dir: vars
                .get("PROTO_DIR")
                .cloned()
                .unwrap_or_else(|| "protos".to_string()),
            rules_dir: vars
                .get("RULES_DIR")
                .cloned()
                .unwrap_or_else(|| "rules/grpc".to_string()),
            grpc: GrpcSettings {
                plaintext_port: parse_port(vars, "GRPC_PORT_PLAINTEXT", DEFAULT_PLAINTEXT_PORT),
                tls_port: parse_port(vars, "GRPC_PORT_TLS", DEFAULT_TLS_PORT),
                tls_enabled: parse_bool(vars, "GRPC_TLS_ENABLED", false),
                tls_cert_path: non_empty(vars.get("GRPC_TLS_CERT_PATH")),
                tls_key_path: non_empty(vars.get("GRPC_TLS_KEY_PATH")),
                tls_ca_path: non_empty(vars.get("GRPC_TLS_CA_PATH")),
                require_client_cert: parse_bool(vars, "GRPC_TLS_REQUIRE_CLIENT_CERT", false),
            },
            connect: ConnectSettings {
                enabled: parse_bool(vars, "CONNECT_ENABLED", true),
                port: parse_port(vars, "CONNECT_PORT", DEFAULT_CONNECT_PORT),
                tls_enabled: parse_bool(vars, "CONNECT_TLS_ENABLED", false),
                cors_enabled: parse_bool(vars, "CONNECT_CORS_ENABLED", true),
                cors_origins: parse_list(vars.get("CONNECT_CORS_ORIGINS")),
                cors_methods: parse_list(vars.get("CONNECT_CORS_METHODS")),
                cors_headers: parse_list(vars.get("CONNECT_CORS_HEADERS")),
            },
            validation: ValidationSettings {
                enabled: parse_bool(vars, "VALIDATION_ENABLED", true),
                source: match vars.get("VALIDATION_SOURCE").map(String::as_str) {
                    Some("pgv") => ValidationSource::Pgv,
                    Some("protovalidate") => ValidationSource::Protovalidate,
                    Some("auto") | None => ValidationSource::Auto,
                    Some(other) => {
                        warn!(value = other, "unrecognized VALIDATION_SOURCE, using auto");
                        ValidationSource::Auto
                    }
                },
                mode: match vars.get("VALIDATION_MODE").map(String::as_str) {
                    Some("aggregate") => ValidationMode::Aggregate,
                    Some("per_message") | None => ValidationMode::PerMessage,
                    Some(other) => {
                        warn!(value = other, "unrecognized VALIDATION_MODE, using per_message");
                        ValidationMode::PerMessage
                    }
                },
                cel_message: matches!(
                    vars.get("VALIDATION_CEL_MESSAGE").map(String::as_str),
                    Some("experimental")
                ),
            },
            reload: ReloadSettings {
                watch_protos: parse_bool(vars, "HOT_RELOAD_PROTOS", true),
                watch_rules: parse_bool(vars, "HOT_RELOAD_RULES", true),
                drain_timeout: Duration::from_millis(parse_u64(
                    vars,
                    "DRAIN_TIMEOUT_MS",
                    DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
                )),
            },
        }
    }
}

/// Parse a boolean env value accepting `true/false/1/0` case-insensitively.
fn parse_bool(vars: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match vars.get(key) {
        None => default,
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                warn!(key, value = other, "unrecognized boolean value, using default");
                default
            }
        },
    }
}

fn parse_port(vars: &HashMap<String, String>, key: &str, default: u16) -> u16 {
    match vars.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                warn!(key, value = raw.as_str(), "invalid port, using default");
                default
            }
        },
    }
}

fn parse_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    match vars.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                warn!(key, value = raw.as_str(), "invalid integer, using default");
                default
            }
        },
    }
}

/// Split a comma-separated value into trimmed, non-empty entries.
fn parse_list(raw: Option<&String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn non_empty(raw: Option<&String>) -> Option<String> {
    raw.map(|s| s.trim()).filter(|s| !s.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let settings = Settings::from_map(&HashMap::new());
        assert_eq!(settings.grpc.plaintext_port, 50050);
        assert_eq!(settings.grpc.tls_port, 50051);
        assert_eq!(settings.connect.port, 50052);
        assert!(settings.connect.enabled);
        assert!(settings.validation.enabled);
        assert_eq!(settings.validation.mode, ValidationMode::PerMessage);
        assert_eq!(settings.validation.source, ValidationSource::Auto);
        assert!(!settings.validation.cel_message);
        assert!(settings.reload.watch_protos);
        assert!(settings.reload.watch_rules);
        assert!(!settings.grpc.tls_requested());
    }

    #[test]
    fn boolean_parsing_accepts_numeric_forms() {
        let settings = Settings::from_map(&vars(&[
            ("GRPC_TLS_ENABLED", "1"),
            ("CONNECT_ENABLED", "0"),
            ("HOT_RELOAD_RULES", "FALSE"),
        ]));
        assert!(settings.grpc.tls_enabled);
        assert!(!settings.connect.enabled);
        assert!(!settings.reload.watch_rules);
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        let settings = Settings::from_map(&vars(&[("GRPC_PORT_PLAINTEXT", "not-a-port")]));
        assert_eq!(settings.grpc.plaintext_port, 50050);
    }

    #[test]
    fn tls_implicitly_requested_by_cert_and_key() {
        let settings = Settings::from_map(&vars(&[
            ("GRPC_TLS_CERT_PATH", "/tmp/server.crt"),
            ("GRPC_TLS_KEY_PATH", "/tmp/server.key"),
        ]));
        assert!(!settings.grpc.tls_enabled);
        assert!(settings.grpc.tls_requested());
    }

    #[test]
    fn cors_lists_are_split_and_trimmed() {
        let settings = Settings::from_map(&vars(&[(
            "CONNECT_CORS_ORIGINS",
            "https://a.example, https://b.example ,",
        )]));
        assert_eq!(
            settings.connect.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn validation_switches() {
        let settings = Settings::from_map(&vars(&[
            ("VALIDATION_SOURCE", "pgv"),
            ("VALIDATION_MODE", "aggregate"),
            ("VALIDATION_CEL_MESSAGE", "experimental"),
        ]));
        assert_eq!(settings.validation.source, ValidationSource::Pgv);
        assert_eq!(settings.validation.mode, ValidationMode::Aggregate);
        assert!(settings.validation.cel_message);
    }
}
