//! Metrics Reporter
//!
//! Periodically logs stream statistics and renders status snapshots

use super::types::{RelayStatus, StatsSnapshot};
use super::StatusSource;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Number of message types shown in each periodic report
pub const TOP_MESSAGE_TYPES: usize = 5;

/// Logs a one-line stream report every `interval`
pub struct StatsReporter {
    status: Arc<dyn StatusSource>,
    interval: Duration,
    expected: Vec<u16>,
}

impl StatsReporter {
    /// Create a new reporter
    pub fn new(status: Arc<dyn StatusSource>, interval: Duration, expected: Vec<u16>) -> Self {
        let mut expected = expected;
        expected.sort_unstable();
        expected.dedup();

        Self {
            status,
            interval,
            expected,
        }
    }

    /// Report until `shutdown` fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.status.status();
                    info!(
                        state = ?status.upstream.state,
                        subscribers = status.subscribers.len(),
                        "{}",
                        format_report(&status.statistics, &self.expected)
                    );
                    if let Some(top) = format_top_messages(&status.statistics) {
                        info!("    top types: {}", top);
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Stats reporter stopping");
                    return;
                }
            }
        }
    }
}

/// One-line report: elapsed time, bytes, rate and expected message counts
pub fn format_report(snapshot: &StatsSnapshot, expected: &[u16]) -> String {
    let mut line = format!(
        "[{:>6}s] bytes={}  rate={:.1} B/s  frames={:.1}/s",
        snapshot.uptime_secs, snapshot.bytes_received, snapshot.bytes_per_sec, snapshot.frames_per_sec
    );

    if !expected.is_empty() {
        let counts: Vec<String> = expected
            .iter()
            .map(|t| format!("{}: {}", t, snapshot.message_counts.get(t).copied().unwrap_or(0)))
            .collect();
        let _ = write!(line, "  expected: {}", counts.join(" | "));
    }

    line
}

/// Most frequent message types as `type(count)`, `None` before the first frame
pub fn format_top_messages(snapshot: &StatsSnapshot) -> Option<String> {
    let top = snapshot.top_messages(TOP_MESSAGE_TYPES);
    if top.is_empty() {
        return None;
    }
    Some(
        top.iter()
            .map(|(t, c)| format!("{}({})", t, c))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Log the end-of-run summary
pub fn log_summary(snapshot: &StatsSnapshot) {
    let average = if snapshot.uptime_secs > 0 {
        snapshot.bytes_received as f64 / snapshot.uptime_secs as f64
    } else {
        0.0
    };

    info!(
        duration_secs = snapshot.uptime_secs,
        bytes_received = snapshot.bytes_received,
        bytes_sent = snapshot.bytes_sent,
        valid_frames = snapshot.valid_frames,
        crc_failures = snapshot.crc_failures,
        reconnects = snapshot.reconnects,
        evictions = snapshot.evictions,
        "Relay summary: {} bytes from caster, {} bytes to clients, avg {:.1} B/s",
        snapshot.bytes_received,
        snapshot.bytes_sent,
        average
    );

    for (message_type, count) in &snapshot.message_counts {
        info!("  - {}: {}", message_type, count);
    }
}

/// Export a relay status to JSON format
pub fn export_status_json(status: &RelayStatus) -> anyhow::Result<String> {
    serde_json::to_string_pretty(status)
        .map_err(|e| anyhow::anyhow!("Failed to serialize status to JSON: {}", e))
}

/// Export per-type message counts to CSV format
pub fn export_counts_csv(snapshot: &StatsSnapshot) -> String {
    let mut csv = String::from("Message Type,Count\n");
    for (message_type, count) in &snapshot.message_counts {
        let _ = writeln!(csv, "{},{}", message_type, count);
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::types::UpstreamStatus;
    use crate::supervisor::SupervisorState;

    fn snapshot() -> StatsSnapshot {
        let mut snapshot = StatsSnapshot {
            uptime_secs: 12,
            bytes_received: 2400,
            bytes_per_sec: 200.0,
            frames_per_sec: 3.0,
            ..Default::default()
        };
        snapshot.message_counts.insert(1005, 2);
        snapshot.message_counts.insert(1074, 12);
        snapshot.message_counts.insert(1230, 1);
        snapshot
    }

    #[test]
    fn test_format_report_lists_expected_types() {
        let line = format_report(&snapshot(), &[1005, 1074, 1094]);
        assert!(line.contains("bytes=2400"));
        assert!(line.contains("rate=200.0 B/s"));
        assert!(line.contains("expected: 1005: 2 | 1074: 12 | 1094: 0"));
    }

    #[test]
    fn test_format_report_without_expected_types() {
        let line = format_report(&snapshot(), &[]);
        assert!(!line.contains("expected"));
    }

    #[test]
    fn test_format_top_messages() {
        assert_eq!(
            format_top_messages(&snapshot()).as_deref(),
            Some("1074(12), 1005(2), 1230(1)")
        );
        assert_eq!(format_top_messages(&StatsSnapshot::default()), None);
    }

    #[test]
    fn test_export_status_json() {
        let status = RelayStatus {
            upstream: UpstreamStatus {
                state: SupervisorState::Failed,
                session: None,
                last_error: Some("caster refused".to_string()),
                next_retry_ms: Some(2000),
            },
            subscribers: Vec::new(),
            access: Default::default(),
            statistics: snapshot(),
        };

        let json = export_status_json(&status).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["upstream"]["state"], "failed");
        assert_eq!(value["upstream"]["next_retry_ms"], 2000);
        assert_eq!(value["statistics"]["message_counts"]["1074"], 12);
    }

    #[test]
    fn test_export_counts_csv() {
        let csv = export_counts_csv(&snapshot());
        assert_eq!(csv, "Message Type,Count\n1005,2\n1074,12\n1230,1\n");
    }
}
