//! Relay Assembly
//!
//! Wires the upstream supervisor, the relay hub and the downstream server
//! together and runs them until shutdown.

use crate::auth::AuthManager;
use crate::config::Config;
use crate::connection::DownstreamServer;
use crate::metrics::{log_summary, MetricsServer, RelayStatus, Statistics, StatsReporter, StatusSource};
use crate::relay::RelayHub;
use crate::shutdown::{join_with_timeout, ShutdownCoordinator};
use crate::supervisor::{ReconnectSupervisor, SupervisorStatus};
use crate::upstream::UpstreamClient;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

/// Read-only view over the running relay
struct CasterStatus {
    hub: Arc<RelayHub>,
    stats: Arc<Statistics>,
    auth_manager: Arc<AuthManager>,
    upstream: watch::Receiver<SupervisorStatus>,
}

impl StatusSource for CasterStatus {
    fn status(&self) -> RelayStatus {
        RelayStatus {
            upstream: self.upstream.borrow().upstream_status(),
            subscribers: self.hub.subscribers(),
            access: self.auth_manager.stats(),
            statistics: self.stats.snapshot(),
        }
    }
}

/// A complete relay: one upstream session fanned out to local clients
pub struct Caster {
    config: Arc<Config>,
    stats: Arc<Statistics>,
    hub: Arc<RelayHub>,
    server: DownstreamServer,
    supervisor: ReconnectSupervisor,
    metrics_server: Option<MetricsServer>,
    status: Arc<CasterStatus>,
    local_addr: Option<SocketAddr>,
}

impl Caster {
    /// Create a new relay from a validated configuration
    pub fn new(config: Arc<Config>) -> Self {
        let stats = Arc::new(Statistics::with_window(config.monitoring.rate_window));
        let hub = Arc::new(RelayHub::from_config(&config, Arc::clone(&stats)));

        let server = DownstreamServer::new(Arc::clone(&config), Arc::clone(&hub), Arc::clone(&stats));
        let client = UpstreamClient::new(Arc::clone(&config), Arc::clone(&hub), Arc::clone(&stats));
        let supervisor = ReconnectSupervisor::new(client, config.reconnect.clone(), Arc::clone(&stats));

        let status = Arc::new(CasterStatus {
            hub: Arc::clone(&hub),
            stats: Arc::clone(&stats),
            auth_manager: Arc::clone(server.auth_manager()),
            upstream: supervisor.subscribe(),
        });

        let metrics_server = config.monitoring.metrics_addr.map(|addr| {
            let source: Arc<dyn StatusSource> = status.clone();
            MetricsServer::new(Arc::clone(&stats), source, addr)
        });

        Self {
            config,
            stats,
            hub,
            server,
            supervisor,
            metrics_server,
            status,
            local_addr: None,
        }
    }

    /// Process-wide statistics
    pub fn stats(&self) -> Arc<Statistics> {
        Arc::clone(&self.stats)
    }

    /// The relay hub clients are attached to
    pub fn hub(&self) -> Arc<RelayHub> {
        Arc::clone(&self.hub)
    }

    /// Status view usable after [`Caster::run`] takes ownership
    pub fn status_source(&self) -> Arc<dyn StatusSource> {
        self.status.clone()
    }

    pub fn status(&self) -> RelayStatus {
        self.status.status()
    }

    /// Address clients connect to, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the client listener and the optional metrics listener.
    /// Either failing is fatal.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr = self.server.bind().await?;
        if let Some(metrics_server) = self.metrics_server.as_mut() {
            metrics_server.bind().await?;
        }
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Run every component until `shutdown` fires, then drain clients
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if self.local_addr.is_none() {
            self.bind().await?;
        }

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let coordinator = ShutdownCoordinator::new(shutdown_timeout);
        let server = Arc::new(self.server);
        let supervisor = Arc::new(self.supervisor);
        let mut tasks = Vec::new();

        tasks.push(("supervisor", {
            let supervisor = Arc::clone(&supervisor);
            let rx = coordinator.subscribe();
            tokio::spawn(async move { supervisor.run(rx).await })
        }));

        tasks.push(("downstream", {
            let server = Arc::clone(&server);
            let rx = coordinator.subscribe();
            tokio::spawn(async move {
                if let Err(e) = server.run(rx).await {
                    error!("Downstream server error: {:#}", e);
                }
            })
        }));

        if let Some(metrics_server) = self.metrics_server {
            let rx = coordinator.subscribe();
            tasks.push((
                "metrics",
                tokio::spawn(async move {
                    if let Err(e) = metrics_server.run(rx).await {
                        error!("Metrics server error: {:#}", e);
                    }
                }),
            ));
        }

        if !self.config.monitoring.report_interval.is_zero() {
            let reporter = StatsReporter::new(
                self.status.clone(),
                self.config.monitoring.report_interval,
                self.config.monitoring.expected_messages.clone(),
            );
            let rx = coordinator.subscribe();
            tasks.push(("reporter", tokio::spawn(async move { reporter.run(rx).await })));
        }

        info!(
            upstream = %self.config.upstream_addr(),
            mountpoint = %self.config.accepted_mountpoint(),
            "Relay running"
        );

        // A closed channel means the owner is gone; treat it as shutdown
        let _ = shutdown.recv().await;
        info!("Shutting down relay");

        coordinator.trigger();
        let detached = self.hub.close_all();
        if detached > 0 {
            info!("Detached {} subscribers", detached);
        }
        coordinator.drain_downstream(&server).await;

        for (name, handle) in tasks {
            join_with_timeout(name, handle, shutdown_timeout).await;
        }

        log_summary(&self.stats.snapshot());
        Ok(())
    }
}
