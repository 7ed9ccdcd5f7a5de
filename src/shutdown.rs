//! Graceful Shutdown Handling
//!
//! Fans a single shutdown signal out to the supervisor, the downstream server
//! and the reporting tasks, then drains connected clients.

use crate::connection::DownstreamServer;
use crate::Result;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// How long connected clients get to drain
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every subscriber. Returns how many were listening.
    pub fn trigger(&self) -> usize {
        match self.shutdown_tx.send(()) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("Shutdown triggered with no listeners");
                0
            }
        }
    }

    /// Wait for SIGTERM or SIGINT, then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        if self.trigger() == 0 {
            warn!("Shutdown signal received but nothing is running");
        }
        Ok(())
    }

    /// Stop the downstream server and wait for its clients to disconnect.
    /// Returns the number of connections still open when the timeout ran out.
    pub async fn drain_downstream(&self, server: &DownstreamServer) -> usize {
        info!("Draining downstream clients");
        let remaining = server
            .wait_for_connections_to_close(self.timeout)
            .await;

        if remaining > 0 {
            warn!("{} downstream clients did not close before the timeout", remaining);
        }
        remaining
    }
}

/// Await a spawned task for at most `limit`, aborting it afterwards
pub async fn join_with_timeout(name: &str, handle: tokio::task::JoinHandle<()>, limit: Duration) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(())) => debug!("Task {} finished", name),
        Ok(Err(e)) if e.is_cancelled() => debug!("Task {} was cancelled", name),
        Ok(Err(e)) => error!("Task {} failed: {}", name, e),
        Err(_) => {
            warn!("Task {} did not stop within {:?}, aborting", name, limit);
            abort.abort();
        }
    }
}
