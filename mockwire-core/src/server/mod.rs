//! Protocol adapters and their shared lifecycle.
//!
//! Each listener moves through `Starting -> Listening -> Draining ->
//! Stopped`. A reload drains all listening adapters in parallel (bounded by
//! the configured timeout), then brings up replacements before readiness is
//! set again.

pub mod connect;
pub mod grpc;
pub mod tls;

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{MockwireError, Result};

/// Adapter lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterPhase {
    Starting = 0,
    Listening = 1,
    Draining = 2,
    Stopped = 3,
}

#[derive(Debug, Default)]
struct ActiveConnections {
    count: AtomicUsize,
    drained: Notify,
}

impl ActiveConnections {
    fn enter(self: &Arc<Self>) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(Arc::clone(self))
    }
}

struct ConnectionGuard(Arc<ActiveConnections>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// A running listener. Dropping the handle aborts the accept loop; prefer
/// `graceful_stop` so in-flight requests can finish.
pub struct ServerHandle {
    name: &'static str,
    port: u16,
    phase: Arc<AtomicU8>,
    shutdown: watch::Sender<bool>,
    active: Arc<ActiveConnections>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn phase(&self) -> AdapterPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => AdapterPhase::Starting,
            1 => AdapterPhase::Listening,
            2 => AdapterPhase::Draining,
            _ => AdapterPhase::Stopped,
        }
    }

    /// Stop accepting, wait for in-flight requests up to `timeout`, then
    /// tear the listener down.
    pub async fn graceful_stop(self, timeout: Duration) {
        self.phase
            .store(AdapterPhase::Draining as u8, Ordering::Release);
        let _ = self.shutdown.send(true);

        if self.active.count.load(Ordering::SeqCst) > 0 {
            let wait = async {
                while self.active.count.load(Ordering::SeqCst) > 0 {
                    self.active.drained.notified().await;
                }
            };
            if tokio::time::timeout(timeout, wait).await.is_err() {
                warn!(
                    adapter = self.name,
                    remaining = self.active.count.load(Ordering::SeqCst),
                    "drain timeout, aborting remaining connections"
                );
            }
        }

        self.task.abort();
        let _ = self.task.await;
        self.phase
            .store(AdapterPhase::Stopped as u8, Ordering::Release);
        debug!(adapter = self.name, "adapter stopped");
    }
}

/// Bind a TCP listener and serve `service` on every accepted connection,
/// optionally wrapped in TLS. Returns once listening; serving continues on
/// a background task until `graceful_stop`.
pub(crate) async fn bind_and_serve<S, B>(
    name: &'static str,
    port: u16,
    service: S,
    tls: Option<TlsAcceptor>,
) -> Result<ServerHandle>
where
    S: tower::Service<
            http::Request<hyper::body::Incoming>,
            Response = http::Response<B>,
            Error = std::convert::Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
{
    let phase = Arc::new(AtomicU8::new(AdapterPhase::Starting as u8));
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        MockwireError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to bind {name} listener on {addr}: {e}"),
        ))
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let active = Arc::new(ActiveConnections::default());

    let task = tokio::spawn(accept_loop(
        name,
        listener,
        service,
        tls,
        shutdown_rx,
        Arc::clone(&active),
    ));

    phase.store(AdapterPhase::Listening as u8, Ordering::Release);
    info!(adapter = name, port, "listening");

    Ok(ServerHandle {
        name,
        port,
        phase,
        shutdown: shutdown_tx,
        active,
        task,
    })
}

async fn accept_loop<S, B>(
    name: &'static str,
    listener: TcpListener,
    service: S,
    tls: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
    active: Arc<ActiveConnections>,
) where
    S: tower::Service<
            http::Request<hyper::body::Incoming>,
            Response = http::Response<B>,
            Error = std::convert::Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
{
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => stream,
                Err(err) => {
                    warn!(adapter = name, error = %err, "accept failed");
                    continue;
                }
            },
            _ = shutdown.changed() => {
                debug!(adapter = name, "accept loop shutting down");
                return;
            }
        };

        let service = service.clone();
        let tls = tls.clone();
        let guard = active.enter();

        tokio::spawn(async move {
            // Move the guard in; the counter drops when the connection is
            // fully served.
            let _guard = guard;
            let hyper_service = TowerToHyperService::new(service);
            let builder = auto::Builder::new(TokioExecutor::new());

            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        if let Err(err) = builder
                            .serve_connection_with_upgrades(TokioIo::new(tls_stream), hyper_service)
                            .await
                        {
                            debug!(adapter = name, error = %err, "connection closed with error");
                        }
                    }
                    Err(err) => {
                        debug!(adapter = name, error = %err, "TLS handshake failed");
                    }
                },
                None => {
                    if let Err(err) = builder
                        .serve_connection_with_upgrades(TokioIo::new(stream), hyper_service)
                        .await
                    {
                        debug!(adapter = name, error = %err, "connection closed with error");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_guard_notifies_on_last_drop() {
        let active = Arc::new(ActiveConnections::default());
        let a = active.enter();
        let b = active.enter();
        assert_eq!(active.count.load(Ordering::SeqCst), 2);
        drop(a);
        assert_eq!(active.count.load(Ordering::SeqCst), 1);
        drop(b);
        assert_eq!(active.count.load(Ordering::SeqCst), 0);
    }
}
