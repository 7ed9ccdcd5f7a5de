//! Reconnect Supervisor

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use crate::config::ReconnectConfig;
use crate::error::UpstreamError;
use crate::metrics::types::UpstreamStatus;
use crate::metrics::Statistics;
use crate::upstream::{SessionInfo, UpstreamClient};

/// Supervisor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Streaming,
    Failed,
}

/// Published view of the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub session: Option<Arc<SessionInfo>>,
    pub last_error: Option<String>,
    pub last_delay: Option<Duration>,
    pub next_retry: Option<Instant>,
    pub attempts: u64,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Idle,
            session: None,
            last_error: None,
            last_delay: None,
            next_retry: None,
            attempts: 0,
        }
    }
}

impl SupervisorStatus {
    /// Reporting view of this status
    pub fn upstream_status(&self) -> UpstreamStatus {
        let now = Instant::now();
        UpstreamStatus {
            state: self.state,
            session: self.session.as_ref().map(|session| session.snapshot()),
            last_error: self.last_error.clone(),
            next_retry_ms: self
                .next_retry
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Result of one connect-and-stream cycle
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Shutdown was requested; the supervisor should stop.
    Shutdown,
    /// The session failed; wait `delay` before the next attempt.
    Retry { delay: Duration, error: UpstreamError },
}

/// Drives the upstream client through connect, stream, and backoff
pub struct ReconnectSupervisor {
    client: UpstreamClient,
    reconnect: ReconnectConfig,
    stats: Arc<Statistics>,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl ReconnectSupervisor {
    /// Create a new supervisor in the `Idle` state
    pub fn new(client: UpstreamClient, reconnect: ReconnectConfig, stats: Arc<Statistics>) -> Self {
        let (status_tx, _) = watch::channel(SupervisorStatus::default());
        Self {
            client,
            reconnect,
            stats,
            status_tx,
        }
    }

    /// Backoff policy configured for this supervisor
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(&self.reconnect)
    }

    /// Current status
    pub fn status(&self) -> SupervisorStatus {
        self.status_tx.borrow().clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.status_tx.borrow().state
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// Reporting view of the upstream side
    pub fn upstream_status(&self) -> UpstreamStatus {
        self.status_tx.borrow().upstream_status()
    }

    /// Run until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Reconnect supervisor started");
        let mut policy = self.policy();

        loop {
            match self.attempt(&mut policy, &mut shutdown).await {
                AttemptOutcome::Shutdown => break,
                AttemptOutcome::Retry { delay, .. } => {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            debug!("Backoff interrupted by shutdown");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.stats.record_reconnect();
                }
            }
        }

        self.status_tx.send_modify(|status| {
            status.state = SupervisorState::Idle;
            status.next_retry = None;
        });
        info!("Reconnect supervisor stopped");
    }

    /// One `Connecting -> Streaming -> Failed` cycle, without the backoff sleep
    pub async fn attempt(
        &self,
        policy: &mut ReconnectPolicy,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> AttemptOutcome {
        let info = self.client.new_session_info();
        self.status_tx.send_modify(|status| {
            status.state = SupervisorState::Connecting;
            status.session = Some(Arc::clone(&info));
            status.next_retry = None;
            status.attempts += 1;
        });

        let connected = tokio::select! {
            _ = shutdown.recv() => return AttemptOutcome::Shutdown,
            result = self.client.connect_session(Arc::clone(&info)) => result,
        };

        let error = match connected {
            Ok(session) => {
                self.status_tx.send_modify(|status| {
                    status.state = SupervisorState::Streaming;
                });
                let started = Instant::now();
                let result = self.client.stream(session, shutdown).await;
                policy.on_session_end(started.elapsed());
                match result {
                    Ok(()) => return AttemptOutcome::Shutdown,
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        let delay = policy.next_delay();
        if let Some(status_line) = error.status_line() {
            warn!(
                attempt = policy.consecutive_failures(),
                "Upstream handshake failed ({}): {}; retrying in {:?}", status_line, error, delay
            );
        } else {
            warn!(
                attempt = policy.consecutive_failures(),
                "Upstream session failed: {}; retrying in {:?}", error, delay
            );
        }

        let message = error.to_string();
        self.status_tx.send_modify(|status| {
            status.state = SupervisorState::Failed;
            status.last_error = Some(message);
            status.last_delay = Some(delay);
            status.next_retry = Some(Instant::now() + delay);
        });

        AttemptOutcome::Retry { delay, error }
    }
}
