//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "NTRIP_RELAY_";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::load_from_str(&content)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn load_from_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    /// Load the file, or defaults when it is missing, then apply
    /// `NTRIP_RELAY_*` overrides from `lookup` on top
    pub fn load<F>(path: &Path, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load_from_file(path)?;
        config.apply_env(lookup)?;
        config
            .validate()
            .context("Configuration invalid after environment overrides")?;
        Ok(config)
    }
}

impl Config {
    /// Override fields from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(host) = var("UPSTREAM_HOST") {
            self.upstream.host = host;
        }
        if let Some(port) = var("UPSTREAM_PORT") {
            self.upstream.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid {ENV_PREFIX}UPSTREAM_PORT: {}", port))?;
        }
        if let Some(mountpoint) = var("UPSTREAM_MOUNTPOINT") {
            self.upstream.mountpoint = mountpoint;
        }
        if let Some(username) = var("UPSTREAM_USERNAME") {
            self.upstream.username = username;
        }
        if let Some(password) = var("UPSTREAM_PASSWORD") {
            self.upstream.password = password;
        }
        if let Some(bind_addr) = var("BIND_ADDR") {
            self.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid {ENV_PREFIX}BIND_ADDR: {}", bind_addr))?;
        }
        if let Some(mountpoint) = var("LOCAL_MOUNTPOINT") {
            self.server.mountpoint = mountpoint;
        }
        if let Some(username) = var("LOCAL_USERNAME") {
            self.server.username = username;
        }
        if let Some(password) = var("LOCAL_PASSWORD") {
            self.server.password = password;
        }
        if let Some(max_clients) = var("MAX_CLIENTS") {
            self.server.max_clients = max_clients
                .parse::<usize>()
                .with_context(|| format!("Invalid {ENV_PREFIX}MAX_CLIENTS: {}", max_clients))?;
        }
        if let Some(read_timeout) = var("READ_TIMEOUT") {
            self.upstream.read_timeout = humantime::parse_duration(&read_timeout)
                .with_context(|| format!("Invalid {ENV_PREFIX}READ_TIMEOUT: {}", read_timeout))?;
        }
        if let Some(metrics_addr) = var("METRICS_ADDR") {
            self.monitoring.metrics_addr = Some(
                metrics_addr
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid {ENV_PREFIX}METRICS_ADDR: {}", metrics_addr))?,
            );
        }
        if let Some(log_level) = var("LOG_LEVEL") {
            self.monitoring.log_level = log_level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_upstream_config()
            .context("Upstream configuration validation failed")?;
        self.validate_server_config()
            .context("Server configuration validation failed")?;
        self.validate_reconnect_config()
            .context("Reconnect configuration validation failed")?;
        self.validate_monitoring_config()
            .context("Monitoring configuration validation failed")?;
        Ok(())
    }

    fn validate_upstream_config(&self) -> Result<()> {
        let upstream = &self.upstream;
        if upstream.host.trim().is_empty() {
            bail!("upstream.host must not be empty");
        }
        if upstream.port == 0 {
            bail!("upstream.port must be greater than 0");
        }
        validate_mountpoint("upstream.mountpoint", &upstream.mountpoint)?;
        if upstream.username.contains(':') {
            bail!("upstream.username must not contain ':'");
        }
        if upstream.connect_timeout.is_zero()
            || upstream.handshake_timeout.is_zero()
            || upstream.read_timeout.is_zero()
        {
            bail!("upstream timeouts must be greater than 0");
        }
        if upstream.buffer_size < 256 {
            bail!("upstream.buffer_size must be at least 256 bytes");
        }
        if upstream.buffer_size > 1048576 {
            bail!("upstream.buffer_size cannot exceed 1MB");
        }
        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let server = &self.server;
        if !server.mountpoint.is_empty() {
            validate_mountpoint("server.mountpoint", &server.mountpoint)?;
        }
        if server.username.contains(':') {
            bail!("server.username must not contain ':'");
        }
        if server.username.is_empty() && !server.password.is_empty() {
            bail!("server.password is set but server.username is empty");
        }
        if server.max_clients == 0 {
            bail!("server.max_clients must be greater than 0");
        }
        if server.max_clients > 10000 {
            bail!("server.max_clients cannot exceed 10,000");
        }
        if server.queue_capacity == 0 {
            bail!("server.queue_capacity must be greater than 0");
        }
        if server.queue_capacity > 65536 {
            bail!("server.queue_capacity cannot exceed 65536 chunks");
        }
        if server.handshake_timeout.is_zero() || server.write_timeout.is_zero() {
            bail!("server timeouts must be greater than 0");
        }
        Ok(())
    }

    fn validate_reconnect_config(&self) -> Result<()> {
        let reconnect = &self.reconnect;
        if reconnect.initial_delay.is_zero() {
            bail!("reconnect.initial_delay must be greater than 0");
        }
        if reconnect.max_delay < reconnect.initial_delay {
            bail!("reconnect.max_delay must not be shorter than reconnect.initial_delay");
        }
        if !(reconnect.multiplier >= 1.0 && reconnect.multiplier.is_finite()) {
            bail!("reconnect.multiplier must be a finite number >= 1.0");
        }
        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }
        if self.monitoring.report_interval.is_zero() {
            bail!("monitoring.report_interval must be greater than 0");
        }
        if self.monitoring.rate_window < std::time::Duration::from_secs(1) {
            bail!("monitoring.rate_window must be at least 1s");
        }
        if let Some(t) = self.monitoring.expected_messages.iter().find(|t| **t > 4095) {
            bail!("monitoring.expected_messages contains {} which does not fit in 12 bits", t);
        }
        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        log_level: Option<&str>,
        metrics_addr: Option<&str>,
    ) {
        if let Some(bind_str) = bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(level) = log_level {
            self.monitoring.log_level = level.to_string();
        }

        if let Some(addr_str) = metrics_addr {
            if let Ok(addr) = addr_str.parse::<SocketAddr>() {
                self.monitoring.metrics_addr = Some(addr);
                tracing::info!("CLI override: metrics address set to {}", addr);
            } else {
                tracing::warn!("Invalid metrics address provided: {}", addr_str);
            }
        }
    }
}

fn validate_mountpoint(field: &str, mountpoint: &str) -> Result<()> {
    let name = mountpoint.trim_start_matches('/');
    if name.is_empty() {
        bail!("{} must not be empty", field);
    }
    if name.len() > 100 {
        bail!("{} exceeds 100 characters", field);
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/' || c == ';') {
        bail!("{} contains whitespace, '/' or ';'", field);
    }
    Ok(())
}
