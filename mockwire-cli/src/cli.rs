use clap::Parser;

/// mockwire: serve mock gRPC/Connect responses from proto schemas and rule
/// files.
///
/// Behavior is driven by the environment (see the README for the full
/// variable list); the flags here cover the common overrides.
#[derive(Debug, Parser)]
#[command(name = "mockwire", version, about)]
pub struct Cli {
    /// Directory holding the .proto schema sources.
    #[arg(long, env = "PROTO_DIR", default_value = "protos")]
    pub proto_dir: String,

    /// Directory holding per-method rule files.
    #[arg(long, env = "RULES_DIR", default_value = "rules/grpc")]
    pub rules_dir: String,

    /// Override the plaintext gRPC port.
    #[arg(long, env = "GRPC_PORT_PLAINTEXT")]
    pub grpc_port: Option<u16>,

    /// Override the TLS gRPC port.
    #[arg(long, env = "GRPC_PORT_TLS")]
    pub tls_port: Option<u16>,

    /// Override the Connect HTTP port.
    #[arg(long, env = "CONNECT_PORT")]
    pub connect_port: Option<u16>,

    /// Disable the file-system watchers (no hot reload).
    #[arg(long)]
    pub no_watch: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["mockwire"]);
        assert_eq!(cli.proto_dir, "protos");
        assert_eq!(cli.rules_dir, "rules/grpc");
        assert!(cli.grpc_port.is_none());
        assert!(!cli.no_watch);
    }

    #[test]
    fn flag_overrides() {
        let cli = Cli::parse_from([
            "mockwire",
            "--proto-dir",
            "/tmp/protos",
            "--grpc-port",
            "6000",
            "--no-watch",
        ]);
        assert_eq!(cli.proto_dir, "/tmp/protos");
        assert_eq!(cli.grpc_port, Some(6000));
        assert!(cli.no_watch);
    }
}
