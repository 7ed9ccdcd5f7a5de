//! Reporting Types

use std::collections::BTreeMap;

use serde::Serialize;

use crate::auth::AuthStatsSnapshot;
use crate::relay::SubscriberSnapshot;
use crate::supervisor::SupervisorState;
use crate::upstream::SessionSnapshot;

/// Point-in-time copy of [`super::Statistics`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub valid_frames: u64,
    pub crc_failures: u64,
    pub resyncs: u64,
    pub noise_bytes: u64,
    pub evictions: u64,
    pub reconnects: u64,
    pub bytes_per_sec: f64,
    pub frames_per_sec: f64,
    pub message_counts: BTreeMap<u16, u64>,
}

impl StatsSnapshot {
    /// Most frequent message types, highest count first
    pub fn top_messages(&self, limit: usize) -> Vec<(u16, u64)> {
        let mut sorted: Vec<(u16, u64)> = self
            .message_counts
            .iter()
            .map(|(t, c)| (*t, *c))
            .collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        sorted.truncate(limit);
        sorted
    }
}

/// Upstream side of a [`RelayStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub state: SupervisorState,
    pub session: Option<SessionSnapshot>,
    pub last_error: Option<String>,
    pub next_retry_ms: Option<u64>,
}

/// Everything the reporting surface shows
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub upstream: UpstreamStatus,
    pub subscribers: Vec<SubscriberSnapshot>,
    pub access: AuthStatsSnapshot,
    pub statistics: StatsSnapshot,
}

/// Read-only source of [`RelayStatus`] for reporting
pub trait StatusSource: Send + Sync {
    fn status(&self) -> RelayStatus;
}
