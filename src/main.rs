//! ntrip-relay - NTRIP correction stream relay
//!
//! Connects to one upstream NTRIP caster and serves its RTCM3 stream to
//! local NTRIP clients.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ntrip_relay::{config::ConfigManager, Caster, Config, ShutdownCoordinator};

/// CLI arguments for ntrip-relay
#[derive(Parser, Debug)]
#[command(name = "ntrip-relay")]
#[command(about = "Relay an upstream NTRIP/RTCM3 stream to local clients")]
#[command(version)]
#[command(long_about = "
Relay an upstream NTRIP/RTCM3 correction stream to local NTRIP clients.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

Environment variables:
  NTRIP_RELAY_UPSTREAM_HOST        - Upstream caster host
  NTRIP_RELAY_UPSTREAM_PORT        - Upstream caster port
  NTRIP_RELAY_UPSTREAM_MOUNTPOINT  - Upstream mountpoint
  NTRIP_RELAY_UPSTREAM_USERNAME    - Upstream username
  NTRIP_RELAY_UPSTREAM_PASSWORD    - Upstream password
  NTRIP_RELAY_BIND_ADDR            - Local listen address (e.g., 0.0.0.0:8888)
  NTRIP_RELAY_LOCAL_MOUNTPOINT     - Mountpoint served locally
  NTRIP_RELAY_LOCAL_USERNAME       - Username local clients must send
  NTRIP_RELAY_LOCAL_PASSWORD       - Password local clients must send
  NTRIP_RELAY_MAX_CLIENTS          - Maximum concurrent local clients
  NTRIP_RELAY_READ_TIMEOUT         - Upstream stall timeout (e.g., 30s)
  NTRIP_RELAY_METRICS_ADDR         - Metrics/status HTTP address
  NTRIP_RELAY_LOG_LEVEL            - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 0.0.0.0:8888)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Metrics and status endpoint address
    #[arg(long, help = "Serve /metrics and /stats on this address")]
    pub metrics_addr: Option<String>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Priority: CLI args > environment > config file > defaults
    let mut config = ConfigManager::load(&args.config, |key| std::env::var(key).ok())?;

    init_tracing(&args, &config)?;

    info!("Starting ntrip-relay v{}", env!("CARGO_PKG_VERSION"));

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.log_level.as_deref(),
        args.metrics_addr.as_deref(),
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    log_config_summary(&config);

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let config = Arc::new(config);
    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);

    let mut caster = Caster::new(Arc::clone(&config));
    caster.bind().await.context("Failed to start relay")?;

    let relay_handle = tokio::spawn(caster.run(shutdown_coordinator.subscribe()));

    info!("Relay started, press Ctrl+C or send SIGTERM to stop");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    match relay_handle.await {
        Ok(result) => result?,
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Relay task failed: {}", e),
    }

    info!("Relay shutdown complete");
    Ok(())
}

/// Log the effective configuration with secrets masked
fn log_config_summary(config: &Config) {
    info!("Configuration summary:");
    info!(
        "  Upstream: {}/{} (user: {})",
        config.upstream_addr(),
        config.upstream.mountpoint.trim_start_matches('/'),
        display_user(&config.upstream.username)
    );
    info!("  Upstream password: {}", mask(&config.upstream.password));
    info!(
        "  Local caster: {}/{}",
        config.server.bind_addr,
        config.accepted_mountpoint()
    );
    info!(
        "  Client authentication: {}",
        if config.client_auth_required() {
            "enabled"
        } else {
            "disabled"
        }
    );
    info!("  Max clients: {}", config.server.max_clients);
    info!(
        "  Reconnect backoff: {:?} .. {:?} (x{})",
        config.reconnect.initial_delay, config.reconnect.max_delay, config.reconnect.multiplier
    );
    match config.monitoring.metrics_addr {
        Some(addr) => info!("  Metrics endpoint: http://{}/metrics", addr),
        None => info!("  Metrics endpoint: disabled"),
    }
}

fn display_user(username: &str) -> &str {
    if username.is_empty() {
        "<none>"
    } else {
        username
    }
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<none>"
    } else {
        "********"
    }
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level
            .as_deref()
            .unwrap_or(&config.monitoring.log_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
