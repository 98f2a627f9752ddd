//! Local TCP tunnel primitive
//!
//! A tunnel is a loopback listener that hands every accepted connection to a
//! [`ConnectionHandler`], which does whatever bidirectional forwarding it
//! needs (typically a Kubernetes port-forward stream). Tunnels are tracked in
//! a [`TunnelRegistry`] keyed by local port so a scenario that crashed
//! half-way can be restarted on the same port without "address in use".
//!
//! The registry is an explicit context object rather than a static: each
//! worker owns one, and tests build as many independent registries as they
//! like.

pub mod net;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupOutcome, CleanupReport};
use crate::{Error, Result};

/// How long `stop` waits for the accept loop to release the socket
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed accept so persistent errors (EMFILE) do not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Forwards one accepted local connection.
///
/// Errors returned here are logged and dropped; they never stop the listener.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Pipe `socket` to wherever this tunnel leads
    async fn handle(&self, socket: TcpStream) -> Result<()>;
}

/// The remote end a tunnel leads to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Resource the tunnel reaches, e.g. `svc/kuack-node-0-abc` or `pod/x`
    pub resource: String,
    /// Port on that resource
    pub port: u16,
}

impl TunnelTarget {
    /// Create a target
    pub fn new(resource: impl Into<String>, port: u16) -> Self {
        Self {
            resource: resource.into(),
            port,
        }
    }
}

/// Lifecycle of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Listening, not yet verified reachable
    Starting,
    /// Verified connectable
    Ready,
    /// Not tracked (never started, or stopped)
    Stopped,
}

/// Snapshot of a tracked tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    /// Local port the listener is bound to
    pub local_port: u16,
    /// Local address the listener is bound to
    pub host: Ipv4Addr,
    /// Where accepted connections are forwarded
    pub target: TunnelTarget,
    /// Current lifecycle state
    pub state: TunnelState,
}

struct TunnelEntry {
    info: TunnelInfo,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for TunnelEntry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Process-scoped registry of local tunnels, keyed by local port
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<Mutex<HashMap<u16, TunnelEntry>>>,
}

impl TunnelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a tunnel on `host:port`.
    ///
    /// An existing tunnel on the same port is stopped first. If the port is
    /// held by anything outside this registry the call fails before anything
    /// is registered.
    pub async fn start(
        &self,
        port: u16,
        host: Ipv4Addr,
        target: TunnelTarget,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<TunnelInfo> {
        if self.stop(port).await == CleanupOutcome::Removed {
            debug!(port, "Replaced existing tunnel");
        }

        net::assert_port_free(host, port)?;

        let addr = SocketAddr::from((host, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::tunnel(port, format!("failed to bind {}: {}", addr, e)))?;

        let info = TunnelInfo {
            local_port: port,
            host,
            target,
            state: TunnelState::Starting,
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, port, handler, cancel.clone()));

        info!(
            port,
            target = %info.target.resource,
            target_port = info.target.port,
            "Tunnel listening"
        );

        self.tunnels.lock().insert(
            port,
            TunnelEntry {
                info: info.clone(),
                cancel,
                task,
            },
        );
        Ok(info)
    }

    /// Mark a tunnel as verified reachable
    pub fn mark_ready(&self, port: u16) -> Result<()> {
        let mut tunnels = self.tunnels.lock();
        let entry = tunnels
            .get_mut(&port)
            .ok_or_else(|| Error::not_found("tunnel", port.to_string()))?;
        entry.info.state = TunnelState::Ready;
        Ok(())
    }

    /// Current state of the tunnel on `port`
    pub fn state(&self, port: u16) -> TunnelState {
        self.tunnels
            .lock()
            .get(&port)
            .map(|e| e.info.state)
            .unwrap_or(TunnelState::Stopped)
    }

    /// Snapshot of the tunnel on `port`, if tracked
    pub fn info(&self, port: u16) -> Option<TunnelInfo> {
        self.tunnels.lock().get(&port).map(|e| e.info.clone())
    }

    /// Ports currently tracked, ascending
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.tunnels.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stop the tunnel on `port`.
    ///
    /// Unknown or already-stopped ports are a no-op reported as
    /// `AlreadyAbsent`.
    pub async fn stop(&self, port: u16) -> CleanupOutcome {
        // Remove first so a concurrent stop of the same port is a no-op
        let entry = self.tunnels.lock().remove(&port);
        let Some(mut entry) = entry else {
            return CleanupOutcome::AlreadyAbsent;
        };

        entry.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, &mut entry.task).await {
            Ok(Ok(())) => {
                info!(port, target = %entry.info.target.resource, "Tunnel stopped");
                CleanupOutcome::Removed
            }
            Ok(Err(e)) => {
                // The accept loop panicked; its listener is gone either way
                warn!(port, error = %e, "Tunnel task ended abnormally");
                CleanupOutcome::Removed
            }
            Err(_) => {
                entry.task.abort();
                CleanupOutcome::Failed(format!(
                    "listener on port {} did not exit within {:?}",
                    port, STOP_TIMEOUT
                ))
            }
        }
    }

    /// Stop every tracked tunnel concurrently, collecting per-port outcomes
    pub async fn stop_all(&self) -> CleanupReport {
        let ports = self.ports();
        let mut report = CleanupReport::new();
        if ports.is_empty() {
            return report;
        }

        info!(count = ports.len(), "Stopping tunnels");
        let outcomes = join_all(ports.iter().map(|&p| self.stop(p))).await;
        for (port, outcome) in ports.into_iter().zip(outcomes) {
            report.record(format!("tunnel/{}", port), outcome);
        }
        report.log_failures("tunnel stop_all");
        report
    }
}

async fn accept_backoff(port: u16, error: &std::io::Error) {
    debug!(port, error = %error, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    handler: Arc<dyn ConnectionHandler>,
    cancel: CancellationToken,
) {
    // Forwarders live in the set so they are aborted together with the tunnel
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let handler = handler.clone();
                    connections.spawn(async move {
                        if let Err(e) = handler.handle(socket).await {
                            debug!(port, peer = %peer, error = %e, "Forwarded connection ended with error");
                        }
                    });
                }
                Err(e) => accept_backoff(port, &e).await,
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    debug!(port, error = %e, "Forwarder task aborted");
                }
            }
        }
    }

    connections.abort_all();
}
