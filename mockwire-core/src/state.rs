use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::rules::RuleSet;
use crate::schema::SchemaSet;
use crate::validation::ValidatorSet;

/// One generation of loaded state: schema, rules, and validation IR.
///
/// The triple always publishes together; a request sees either this
/// generation or the previous one, never a mix.
#[derive(Debug, Default)]
pub struct EngineState {
    pub schema: SchemaSet,
    pub rules: RuleSet,
    pub validators: ValidatorSet,
}

/// What triggered the most recent reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadMode {
    Initial,
    Watcher,
    Manual,
}

/// Reload bookkeeping surfaced in the status payload.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadInfo {
    pub last_triggered: Option<DateTime<Utc>>,
    pub mode: ReloadMode,
    pub downtime_detected: bool,
    pub last_error: Option<String>,
}

impl Default for ReloadInfo {
    fn default() -> Self {
        ReloadInfo {
            last_triggered: None,
            mode: ReloadMode::Initial,
            downtime_detected: false,
            last_error: None,
        }
    }
}

/// Process-wide shared state: the swappable engine generation, the
/// readiness flag, and reload metadata.
///
/// Readers snapshot the current generation once per call with `load()`;
/// the hot-reload coordinator is the only writer.
#[derive(Debug)]
pub struct SharedState {
    current: ArcSwap<EngineState>,
    ready: AtomicBool,
    reload_info: Mutex<ReloadInfo>,
}

impl Default for SharedState {
    fn default() -> Self {
        SharedState::new(EngineState::default())
    }
}

impl SharedState {
    pub fn new(initial: EngineState) -> Self {
        SharedState {
            current: ArcSwap::from_pointee(initial),
            ready: AtomicBool::new(false),
            reload_info: Mutex::new(ReloadInfo::default()),
        }
    }

    /// Snapshot the current generation. Cheap: one atomic load.
    pub fn load(&self) -> Arc<EngineState> {
        self.current.load_full()
    }

    /// Publish a new generation atomically.
    pub fn publish(&self, state: EngineState) {
        self.current.store(Arc::new(state));
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn reload_info(&self) -> ReloadInfo {
        self.reload_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_reload_info(&self, info: ReloadInfo) {
        *self
            .reload_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = info;
    }
}
