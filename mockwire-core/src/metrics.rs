use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Process-wide counters consumed by the status endpoint.
///
/// Scalar counters are plain atomics; the compound per-key maps take a
/// short-lived mutex per increment. Counters are monotonic and reset only
/// on process exit; reloads do not touch them.
#[derive(Debug, Default)]
pub struct Metrics {
    validation_checks_total: AtomicU64,
    validation_failures_total: AtomicU64,
    validation_failures_by_type: Mutex<BTreeMap<String, u64>>,
    rule_attempts_total: AtomicU64,
    rule_matches_total: AtomicU64,
    rule_misses_total: AtomicU64,
    rule_matches_by_rule: Mutex<BTreeMap<String, u64>>,
    connect_requests: AtomicU64,
    grpc_web_requests: AtomicU64,
    grpc_over_http_requests: AtomicU64,
}

/// Copy-on-read view of the counters, serialized into the status payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub validation: ValidationCounters,
    pub rule_matching: RuleMatchingCounters,
    pub connect_protocols: ProtocolCounters,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationCounters {
    pub checks_total: u64,
    pub failures_total: u64,
    pub failures_by_type: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuleMatchingCounters {
    pub attempts_total: u64,
    pub matches_total: u64,
    pub misses_total: u64,
    pub matches_by_rule: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProtocolCounters {
    pub connect: u64,
    pub grpc_web: u64,
    pub grpc: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_validation_check(&self) {
        self.validation_checks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a validation failure, bucketed by constraint kind
    /// (`string`, `number`, `cel`, ...).
    pub fn record_validation_failure(&self, kind: &str) {
        self.validation_failures_total.fetch_add(1, Ordering::Relaxed);
        let mut by_type = self
            .validation_failures_by_type
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *by_type.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_rule_attempt(&self) {
        self.rule_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_match(&self, rule_key: &str) {
        self.rule_matches_total.fetch_add(1, Ordering::Relaxed);
        let mut by_rule = self
            .rule_matches_by_rule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *by_rule.entry(rule_key.to_string()).or_insert(0) += 1;
    }

    pub fn record_rule_miss(&self) {
        self.rule_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_request(&self) {
        self.connect_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grpc_web_request(&self) {
        self.grpc_web_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grpc_over_http_request(&self) {
        self.grpc_over_http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            validation: ValidationCounters {
                checks_total: self.validation_checks_total.load(Ordering::Relaxed),
                failures_total: self.validation_failures_total.load(Ordering::Relaxed),
                failures_by_type: self
                    .validation_failures_by_type
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone(),
            },
            rule_matching: RuleMatchingCounters {
                attempts_total: self.rule_attempts_total.load(Ordering::Relaxed),
                matches_total: self.rule_matches_total.load(Ordering::Relaxed),
                misses_total: self.rule_misses_total.load(Ordering::Relaxed),
                matches_by_rule: self
                    .rule_matches_by_rule
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone(),
            },
            connect_protocols: ProtocolCounters {
                connect: self.connect_requests.load(Ordering::Relaxed),
                grpc_web: self.grpc_web_requests.load(Ordering::Relaxed),
                grpc: self.grpc_over_http_requests.load(Ordering::Relaxed),
            },
        }
    }
}
