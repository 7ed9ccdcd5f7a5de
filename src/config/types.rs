//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub monitoring: MonitoringConfig,
}

/// Remote caster the relay pulls from
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub username: String,
    pub password: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    pub buffer_size: usize,
    pub user_agent: String,
}

/// Local caster served to downstream clients
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Mountpoint clients must request; empty means the upstream mountpoint
    pub mountpoint: String,
    /// Empty username disables client authentication
    pub username: String,
    pub password: String,
    pub max_clients: usize,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Per-client queue length, in relayed chunks
    pub queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Upstream reconnect backoff
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// A streaming period at least this long resets the backoff
    #[serde(with = "humantime_serde")]
    pub reset_after: Duration,
}

/// Logging and reporting
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub metrics_addr: Option<SocketAddr>,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub rate_window: Duration,
    /// Message types always listed in periodic reports, even at zero
    pub expected_messages: Vec<u16>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2101,
            mountpoint: "RTCM".to_string(),
            username: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            buffer_size: 4096,
            user_agent: concat!("NTRIP ntrip-relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8888)),
            mountpoint: String::new(),
            username: String::new(),
            password: String::new(),
            max_clients: 64,
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            queue_capacity: crate::relay::hub::DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            reset_after: Duration::from_secs(10),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: None,
            report_interval: Duration::from_secs(10),
            rate_window: Duration::from_secs(10),
            expected_messages: vec![1005, 1074, 1084, 1094, 1124],
        }
    }
}

impl Config {
    /// Mountpoint downstream clients must request
    pub fn accepted_mountpoint(&self) -> &str {
        let local = self.server.mountpoint.trim_start_matches('/');
        if local.is_empty() {
            self.upstream.mountpoint.trim_start_matches('/')
        } else {
            local
        }
    }

    /// Whether downstream clients must present credentials
    pub fn client_auth_required(&self) -> bool {
        !self.server.username.is_empty()
    }

    /// `host:port` of the upstream caster
    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream.host, self.upstream.port)
    }
}
