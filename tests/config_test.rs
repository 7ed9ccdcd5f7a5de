//! Configuration file loading through to a running relay

use ntrip_relay::config::ConfigManager;
use ntrip_relay::Caster;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_full_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[upstream]
host = "caster.example.net"
port = 2101
mountpoint = "/MAC01"
username = "rover"
password = "secret"
connect_timeout = "5s"
handshake_timeout = "8s"
read_timeout = "1m"
buffer_size = 8192

[server]
bind_addr = "0.0.0.0:2102"
mountpoint = "LOCAL"
username = "client"
password = "pw"
max_clients = 16
queue_capacity = 64
write_timeout = "3s"

[reconnect]
initial_delay = "2s"
max_delay = "1m"
multiplier = 1.5
reset_after = "30s"

[monitoring]
log_level = "debug"
metrics_addr = "127.0.0.1:9100"
report_interval = "30s"
expected_messages = [1005, 1077, 1087]
"#
    )
    .unwrap();

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    assert_eq!(config.upstream_addr(), "caster.example.net:2101");
    assert_eq!(config.upstream.read_timeout, Duration::from_secs(60));
    assert_eq!(config.server.max_clients, 16);
    assert_eq!(config.accepted_mountpoint(), "LOCAL");
    assert!(config.client_auth_required());
    assert_eq!(config.reconnect.multiplier, 1.5);
    assert_eq!(config.monitoring.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
    assert_eq!(config.monitoring.expected_messages, vec![1005, 1077, 1087]);
}

#[test]
fn test_invalid_file_is_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[server]\nmax_clients = 0").unwrap();
    assert!(ConfigManager::load_from_file(file.path()).is_err());

    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[upstream\nhost = ").unwrap();
    assert!(ConfigManager::load_from_file(file.path()).is_err());
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigManager::load_from_file(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind_addr, "127.0.0.1:8888".parse().unwrap());
    assert_eq!(config.upstream.port, 2101);
}

#[test]
fn test_environment_overrides_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[upstream]\nhost = \"caster.example.net\"\nport = 2101\nmountpoint = \"MAC01\"\n\n[server]\nmax_clients = 16"
    )
    .unwrap();

    let env: HashMap<&str, &str> = [
        ("NTRIP_RELAY_UPSTREAM_HOST", "backup.example.net"),
        ("NTRIP_RELAY_MAX_CLIENTS", "4"),
    ]
    .into_iter()
    .collect();
    let config = ConfigManager::load(file.path(), |key| env.get(key).map(|v| v.to_string())).unwrap();

    assert_eq!(config.upstream_addr(), "backup.example.net:2101");
    assert_eq!(config.server.max_clients, 4);
    // Untouched by the environment
    assert_eq!(config.upstream.mountpoint, "MAC01");

    // Missing file: environment over defaults
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigManager::load(&dir.path().join("absent.toml"), |key| env.get(key).map(|v| v.to_string())).unwrap();
    assert_eq!(config.upstream.host, "backup.example.net");
    assert_eq!(config.upstream.port, 2101);

    let bad: HashMap<&str, &str> = [("NTRIP_RELAY_MAX_CLIENTS", "0")].into_iter().collect();
    assert!(ConfigManager::load(file.path(), |key| bad.get(key).map(|v| v.to_string())).is_err());
}

#[tokio::test]
async fn test_relay_binds_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[upstream]\nport = 1\n\n[server]\nbind_addr = \"127.0.0.1:0\"\n\n[monitoring]\nmetrics_addr = \"127.0.0.1:0\""
    )
    .unwrap();

    let config = ConfigManager::load_from_file(file.path()).unwrap();
    let mut caster = Caster::new(Arc::new(config));
    let addr = caster.bind().await.unwrap();
    assert!(addr.ip().is_loopback());
    assert_eq!(caster.local_addr(), Some(addr));
}
