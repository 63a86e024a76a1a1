mod cli;

use clap::Parser;
use cli::Cli;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mockwire_core::config::Settings;
use mockwire_core::metrics::Metrics;
use mockwire_core::reload::{self, Coordinator};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    settings.proto_dir = cli.proto_dir.clone();
    settings.rules_dir = cli.rules_dir.clone();
    if let Some(port) = cli.grpc_port {
        settings.grpc.plaintext_port = port;
    }
    if let Some(port) = cli.tls_port {
        settings.grpc.tls_port = port;
    }
    if let Some(port) = cli.connect_port {
        settings.connect.port = port;
    }
    if cli.no_watch {
        settings.reload.watch_protos = false;
        settings.reload.watch_rules = false;
    }

    let metrics = Arc::new(Metrics::new());
    let coordinator = Coordinator::new(settings, metrics);

    if let Err(err) = coordinator.start().await {
        error!("failed to start: {err}");
        process::exit(1);
    }

    // Watchers are best-effort: a missing directory disables hot reload but
    // the server keeps serving.
    let watch = coordinator.settings().reload.watch_protos
        || coordinator.settings().reload.watch_rules;
    let _watcher = if watch {
        match reload::spawn_watcher(Arc::clone(&coordinator)) {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("hot reload disabled: {err}");
                None
            }
        }
    } else {
        None
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(err) => error!("failed to listen for shutdown signal: {err}"),
    }
    coordinator.shutdown().await;
}
