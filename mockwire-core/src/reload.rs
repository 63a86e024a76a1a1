//! Hot-reload coordination.
//!
//! File-system events on the proto and rule directories (debounced) or an
//! explicit trigger drive one reload cycle: drain adapters, rebuild the
//! (schema, rules, IR) triple, publish it atomically, restart adapters,
//! flip readiness. Concurrent triggers coalesce into one run via the
//! single-flight lock. Reload failure is fail-closed: the previous triple
//! stays published, adapters come back on it, and readiness stays false
//! until the next successful pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::Watcher as _;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{MockwireError, Result};
use crate::handler::MockHandler;
use crate::metrics::Metrics;
use crate::report::{AdapterHealth, StatusReport, StatusSource};
use crate::rules;
use crate::schema;
use crate::server::connect::{ConnectCtx, ConnectService};
use crate::server::grpc::GrpcMockService;
use crate::server::{bind_and_serve, tls, ServerHandle};
use crate::state::{EngineState, ReloadInfo, ReloadMode, SharedState};
use crate::validation::ValidatorSet;

/// Debounce window for coalescing watcher events.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(300);

/// Reload counts as observable downtime when it exceeds this bound.
const DOWNTIME_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Adapters {
    plaintext: Option<ServerHandle>,
    tls: Option<ServerHandle>,
    connect: Option<ServerHandle>,
}

/// Owns the shared state, the listeners, and the reload protocol.
pub struct Coordinator {
    settings: Settings,
    state: Arc<SharedState>,
    metrics: Arc<Metrics>,
    handler: MockHandler,
    adapters: Mutex<Adapters>,
    health: Arc<std::sync::Mutex<AdapterHealth>>,
    /// Single-flight: concurrent reload triggers coalesce here.
    reload_lock: Mutex<()>,
}

impl Coordinator {
    pub fn new(settings: Settings, metrics: Arc<Metrics>) -> Arc<Self> {
        let state = Arc::new(SharedState::default());
        let handler = MockHandler::new(Arc::clone(&metrics), settings.validation.clone());
        Arc::new(Coordinator {
            settings,
            state,
            metrics,
            handler,
            adapters: Mutex::new(Adapters::default()),
            health: Arc::new(std::sync::Mutex::new(AdapterHealth::default())),
            reload_lock: Mutex::new(()),
        })
    }

    pub fn shared_state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The live handle the status endpoint reads from.
    pub fn status_source(&self) -> StatusSource {
        StatusSource {
            settings: self.settings.clone(),
            state: self.shared_state(),
            metrics: Arc::clone(&self.metrics),
            health: Arc::clone(&self.health),
        }
    }

    /// Initial bring-up: load whatever is on disk (an empty registry is
    /// valid), publish it, and start the listeners. Only a plaintext bind
    /// failure is fatal.
    pub async fn start(&self) -> Result<()> {
        let _flight = self.reload_lock.lock().await;
        let started = std::time::Instant::now();

        let (state, _total_failure) = self.load_state();
        self.state.publish(state);

        let mut adapters = self.adapters.lock().await;
        self.start_adapters(&mut adapters).await?;
        drop(adapters);

        self.state.set_ready(true);
        self.state.set_reload_info(ReloadInfo {
            last_triggered: Some(Utc::now()),
            mode: ReloadMode::Initial,
            downtime_detected: started.elapsed() > DOWNTIME_THRESHOLD,
            last_error: None,
        });

        let snapshot = self.state.load();
        info!(
            services = snapshot.schema.service_names().len(),
            rules = snapshot.rules.len(),
            plaintext_port = self.settings.grpc.plaintext_port,
            "mockwire up"
        );
        Ok(())
    }

    /// One full reload cycle. See the module docs for the protocol.
    pub async fn reload(&self, mode: ReloadMode) -> Result<()> {
        let _flight = self.reload_lock.lock().await;
        let started = std::time::Instant::now();
        let triggered_at = Utc::now();
        info!(?mode, "reload starting");

        // Step 1: drop readiness for the duration.
        self.state.set_ready(false);

        // Step 2: drain current adapters in parallel; errors are collected,
        // not fatal.
        let mut adapters = self.adapters.lock().await;
        let plaintext = adapters.plaintext.take();
        let tls_handle = adapters.tls.take();
        let connect = adapters.connect.take();
        let timeout = self.settings.reload.drain_timeout;
        tokio::join!(
            drain(plaintext, timeout),
            drain(tls_handle, timeout),
            drain(connect, timeout),
        );

        // Step 3-5: rebuild the triple. Total proto failure aborts without
        // replacing state: the previous generation stays published.
        let (new_state, total_failure) = self.load_state();
        if total_failure {
            let message = "proto load failed for every file, keeping previous state".to_string();
            error!("{message}");
            // Fail-closed: restart the listeners on the old state and leave
            // readiness false until a later reload succeeds.
            self.start_adapters(&mut adapters).await?;
            self.state.set_reload_info(ReloadInfo {
                last_triggered: Some(triggered_at),
                mode,
                downtime_detected: started.elapsed() > DOWNTIME_THRESHOLD,
                last_error: Some(message.clone()),
            });
            return Err(MockwireError::Proto(message));
        }

        // Step 6: publish atomically, then bring listeners back.
        self.state.publish(new_state);
        self.start_adapters(&mut adapters).await?;
        drop(adapters);

        // Step 7: readiness.
        self.state.set_ready(true);
        let elapsed = started.elapsed();
        self.state.set_reload_info(ReloadInfo {
            last_triggered: Some(triggered_at),
            mode,
            downtime_detected: elapsed > DOWNTIME_THRESHOLD,
            last_error: None,
        });
        info!(elapsed_ms = elapsed.as_millis() as u64, "reload complete");
        Ok(())
    }

    /// Drain every listener and leave the coordinator stopped.
    pub async fn shutdown(&self) {
        let _flight = self.reload_lock.lock().await;
        self.state.set_ready(false);
        let mut adapters = self.adapters.lock().await;
        let timeout = self.settings.reload.drain_timeout;
        tokio::join!(
            drain(adapters.plaintext.take(), timeout),
            drain(adapters.tls.take(), timeout),
            drain(adapters.connect.take(), timeout),
        );
        info!("all adapters stopped");
    }

    /// Load protos, rules, and validation IR from disk.
    ///
    /// Returns the new generation plus whether the proto load failed
    /// totally (files exist, none parsed).
    fn load_state(&self) -> (EngineState, bool) {
        let schema = schema::load_dir(Path::new(&self.settings.proto_dir));
        let report = schema.report();
        let total_failure = report.loaded.is_empty() && !report.skipped.is_empty();
        for skipped in &report.skipped {
            warn!(file = %skipped.file, error = %skipped.error, "proto skipped");
        }

        let rules = rules::load_dir(Path::new(&self.settings.rules_dir));
        for err in rules.errors() {
            warn!(file = %err.file, error = %err.error, "rule file skipped");
        }

        let validators = ValidatorSet::build(&schema, &self.settings.validation);

        (
            EngineState {
                schema,
                rules,
                validators,
            },
            total_failure,
        )
    }

    /// Start plaintext gRPC (fatal on failure), then TLS gRPC and Connect
    /// (each pass/fail independently, recorded for the status endpoint).
    async fn start_adapters(&self, adapters: &mut Adapters) -> Result<()> {
        let grpc_service = GrpcMockService::new(self.shared_state(), self.handler.clone());
        let mut tls_error = None;
        let mut connect_error = None;

        adapters.plaintext = Some(
            bind_and_serve(
                "grpc-plaintext",
                self.settings.grpc.plaintext_port,
                grpc_service.clone(),
                None,
            )
            .await?,
        );

        adapters.tls = None;
        if self.settings.grpc.tls_requested() {
            match tls::build_acceptor(&self.settings.grpc) {
                Ok(acceptor) => {
                    match bind_and_serve(
                        "grpc-tls",
                        self.settings.grpc.tls_port,
                        grpc_service.clone(),
                        Some(acceptor),
                    )
                    .await
                    {
                        Ok(handle) => adapters.tls = Some(handle),
                        Err(err) => {
                            warn!(error = %err, "TLS listener failed, plaintext stays up");
                            tls_error = Some(err.to_string());
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "TLS initialization failed, plaintext stays up");
                    tls_error = Some(err.to_string());
                }
            }
        }

        adapters.connect = None;
        if self.settings.connect.enabled {
            let ctx = ConnectCtx {
                state: self.shared_state(),
                handler: self.handler.clone(),
                metrics: Arc::clone(&self.metrics),
                status: self.status_source(),
            };
            let service = ConnectService::new(ctx, &self.settings.connect);
            let tls_acceptor = if self.settings.connect.tls_enabled {
                match tls::build_acceptor(&self.settings.grpc) {
                    Ok(acceptor) => Some(acceptor),
                    Err(err) => {
                        warn!(error = %err, "Connect TLS initialization failed");
                        connect_error = Some(err.to_string());
                        None
                    }
                }
            } else {
                None
            };
            match bind_and_serve(
                "connect",
                self.settings.connect.port,
                service,
                tls_acceptor,
            )
            .await
            {
                Ok(handle) => adapters.connect = Some(handle),
                Err(err) => {
                    warn!(error = %err, "Connect listener failed, gRPC stays up");
                    connect_error = Some(err.to_string());
                }
            }
        }

        let mut health = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        health.tls_listening = adapters.tls.is_some();
        health.tls_error = tls_error;
        health.connect_error = connect_error;

        Ok(())
    }

    /// Assemble the status payload for the admin surface.
    pub fn status(&self) -> StatusReport {
        self.status_source().report()
    }
}

async fn drain(handle: Option<ServerHandle>, timeout: Duration) {
    if let Some(handle) = handle {
        handle.graceful_stop(timeout).await;
    }
}

/// Keeps the filesystem watchers alive; dropping it stops watching.
pub struct WatcherHandle {
    _watchers: Vec<notify::RecommendedWatcher>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch the configured directories and trigger debounced reloads.
pub fn spawn_watcher(coordinator: Arc<Coordinator>) -> Result<WatcherHandle> {
    let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watchers = Vec::new();
    let mut watch_dir = |dir: &str| -> Result<()> {
        let tx = tx.clone();
        let mut watcher = notify::recommended_watcher(
            move |event: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(event) = event {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            },
        )
        .map_err(|e| MockwireError::Other(format!("failed to create watcher: {e}").into()))?;
        watcher
            .watch(Path::new(dir), notify::RecursiveMode::Recursive)
            .map_err(|e| {
                MockwireError::Other(format!("failed to watch '{dir}': {e}").into())
            })?;
        watchers.push(watcher);
        Ok(())
    };

    if coordinator.settings.reload.watch_protos {
        watch_dir(&coordinator.settings.proto_dir)?;
    }
    if coordinator.settings.reload.watch_rules {
        watch_dir(&coordinator.settings.rules_dir)?;
    }

    let task = tokio::spawn(debounce_loop(rx, coordinator));

    Ok(WatcherHandle {
        _watchers: watchers,
        task,
    })
}

/// Collapse bursts of events into one reload per debounce window.
async fn debounce_loop(mut rx: mpsc::UnboundedReceiver<PathBuf>, coordinator: Arc<Coordinator>) {
    while let Some(first) = rx.recv().await {
        debug!(path = %first.display(), "change detected");
        tokio::time::sleep(WATCH_DEBOUNCE).await;
        // Drain whatever else arrived during the window.
        while rx.try_recv().is_ok() {}

        if let Err(err) = coordinator.reload(ReloadMode::Watcher).await {
            error!(error = %err, "reload failed");
        }
    }
}
