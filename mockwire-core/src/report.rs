//! The status payload consumed by the external admin surface, and the
//! live source that assembles it. The Connect listener serves it at
//! `GET /status`.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::Settings;
use crate::metrics::{Metrics, MetricsSnapshot, ProtocolCounters};
use crate::rules::RuleLoadError;
use crate::schema::LoadReport;
use crate::state::{ReloadInfo, SharedState};
use crate::validation::Coverage;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub ready: bool,
    pub grpc: GrpcStatus,
    pub connect: ConnectStatus,
    /// Fully qualified service names currently served.
    pub services: Vec<String>,
    /// Rule keys currently loaded from the rule directory.
    pub rule_keys: Vec<String>,
    pub protos: LoadReport,
    pub rule_errors: Vec<RuleLoadError>,
    pub validation: Coverage,
    pub reload: ReloadInfo,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrpcStatus {
    pub plaintext_port: u16,
    pub tls_enabled: bool,
    pub tls_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectStatus {
    pub enabled: bool,
    pub port: u16,
    pub cors: CorsStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Services reachable over the Connect listener (same set as native
    /// gRPC).
    pub services: Vec<String>,
    pub requests: ProtocolCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorsStatus {
    pub enabled: bool,
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
}

/// Listener health recorded by the reload coordinator after each
/// bring-up; read by the status endpoint.
#[derive(Debug, Default)]
pub struct AdapterHealth {
    pub tls_listening: bool,
    pub tls_error: Option<String>,
    pub connect_error: Option<String>,
}

/// Everything needed to assemble a status payload on demand. Clone-cheap;
/// the coordinator hands one to the Connect router.
#[derive(Clone)]
pub struct StatusSource {
    pub settings: Settings,
    pub state: Arc<SharedState>,
    pub metrics: Arc<Metrics>,
    pub health: Arc<Mutex<AdapterHealth>>,
}

impl StatusSource {
    pub fn report(&self) -> StatusReport {
        let snapshot = self.state.load();
        let metrics = self.metrics.snapshot();
        let health = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        StatusReport {
            ready: self.state.is_ready(),
            grpc: GrpcStatus {
                plaintext_port: self.settings.grpc.plaintext_port,
                tls_enabled: health.tls_listening,
                tls_port: self.settings.grpc.tls_port,
                tls_error: health.tls_error.clone(),
            },
            connect: ConnectStatus {
                enabled: self.settings.connect.enabled,
                port: self.settings.connect.port,
                cors: CorsStatus {
                    enabled: self.settings.connect.cors_enabled,
                    origins: self.settings.connect.cors_origins.clone(),
                    methods: self.settings.connect.cors_methods.clone(),
                    headers: self.settings.connect.cors_headers.clone(),
                },
                error: health.connect_error.clone(),
                services: snapshot.schema.service_names(),
                requests: metrics.connect_protocols.clone(),
            },
            services: snapshot.schema.service_names(),
            rule_keys: snapshot.rules.keys(),
            protos: snapshot.schema.report().clone(),
            rule_errors: snapshot.rules.errors().to_vec(),
            validation: snapshot.validators.coverage(),
            reload: self.state.reload_info(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::state::ReloadMode;

    #[test]
    fn serializes_to_json() {
        let metrics = Metrics::new();
        let report = StatusReport {
            ready: true,
            grpc: GrpcStatus {
                plaintext_port: 50050,
                tls_enabled: false,
                tls_port: 50051,
                tls_error: None,
            },
            connect: ConnectStatus {
                enabled: true,
                port: 50052,
                cors: CorsStatus {
                    enabled: true,
                    origins: vec![],
                    methods: vec![],
                    headers: vec![],
                },
                error: None,
                services: vec!["helloworld.Greeter".into()],
                requests: metrics.snapshot().connect_protocols,
            },
            services: vec!["helloworld.Greeter".into()],
            rule_keys: vec!["helloworld.greeter.sayhello".into()],
            protos: LoadReport::default(),
            rule_errors: vec![],
            validation: Coverage {
                total_message_types: 2,
                validated_message_types: 1,
            },
            reload: ReloadInfo {
                last_triggered: None,
                mode: ReloadMode::Initial,
                downtime_detected: false,
                last_error: None,
            },
            metrics: metrics.snapshot(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ready"], true);
        assert_eq!(json["grpc"]["plaintext_port"], 50050);
        // tls_error is omitted when absent.
        assert!(json["grpc"].get("tls_error").is_none());
        assert_eq!(json["reload"]["mode"], "initial");
        assert_eq!(json["validation"]["total_message_types"], 2);
    }

    #[test]
    fn source_assembles_a_live_report() {
        let source = StatusSource {
            settings: Settings::default(),
            state: Arc::new(SharedState::default()),
            metrics: Arc::new(Metrics::new()),
            health: Arc::new(Mutex::new(AdapterHealth {
                tls_listening: false,
                tls_error: Some("no certificate".into()),
                connect_error: None,
            })),
        };

        let report = source.report();
        assert!(!report.ready);
        assert_eq!(report.grpc.plaintext_port, 50050);
        assert_eq!(report.grpc.tls_error.as_deref(), Some("no certificate"));
        assert!(report.services.is_empty());

        source.state.set_ready(true);
        assert!(source.report().ready);
    }
}
