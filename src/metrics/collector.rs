//! Stream Statistics
//!
//! Process-wide counters for the relayed stream. Writers update atomics and a
//! couple of short critical sections; readers take a [`StatsSnapshot`] copy.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

use super::types::StatsSnapshot;
use crate::rtcm::RtcmFrame;

/// Default sliding window for rate computation
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(10);

/// One-second bucket of the sliding window
#[derive(Debug, Clone, Copy)]
struct Sample {
    second: u64,
    bytes: u64,
    frames: u64,
}

/// Prometheus handles mirrored from the internal counters
struct PrometheusMetrics {
    registry: Registry,
    bytes_received: IntCounter,
    bytes_sent: IntCounter,
    frames: IntCounterVec,
    crc_failures: IntCounter,
    resyncs: IntCounter,
    active_subscribers: IntGauge,
    evictions: IntCounter,
    reconnects: IntCounter,
}

impl PrometheusMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let bytes_received = IntCounter::new(
            "ntrip_relay_upstream_bytes_total",
            "Bytes received from the upstream caster",
        )
        .expect("Failed to create upstream_bytes_total counter");

        let bytes_sent = IntCounter::new(
            "ntrip_relay_downstream_bytes_total",
            "Bytes written to downstream clients",
        )
        .expect("Failed to create downstream_bytes_total counter");

        let frames = IntCounterVec::new(
            Opts::new("ntrip_relay_rtcm_frames_total", "Valid RTCM3 frames by message type"),
            &["message_type"],
        )
        .expect("Failed to create rtcm_frames_total counter");

        let crc_failures = IntCounter::new(
            "ntrip_relay_rtcm_crc_failures_total",
            "RTCM3 candidate frames rejected by CRC",
        )
        .expect("Failed to create rtcm_crc_failures_total counter");

        let resyncs = IntCounter::new(
            "ntrip_relay_rtcm_resyncs_total",
            "Times the parser had to search for a new preamble",
        )
        .expect("Failed to create rtcm_resyncs_total counter");

        let active_subscribers = IntGauge::new(
            "ntrip_relay_active_subscribers",
            "Downstream clients currently registered",
        )
        .expect("Failed to create active_subscribers gauge");

        let evictions = IntCounter::new(
            "ntrip_relay_subscriber_evictions_total",
            "Subscribers dropped because their queue overflowed",
        )
        .expect("Failed to create subscriber_evictions_total counter");

        let reconnects = IntCounter::new(
            "ntrip_relay_upstream_reconnects_total",
            "Upstream connection attempts after a failure",
        )
        .expect("Failed to create upstream_reconnects_total counter");

        registry
            .register(Box::new(bytes_received.clone()))
            .expect("Failed to register upstream_bytes_total");
        registry
            .register(Box::new(bytes_sent.clone()))
            .expect("Failed to register downstream_bytes_total");
        registry
            .register(Box::new(frames.clone()))
            .expect("Failed to register rtcm_frames_total");
        registry
            .register(Box::new(crc_failures.clone()))
            .expect("Failed to register rtcm_crc_failures_total");
        registry
            .register(Box::new(resyncs.clone()))
            .expect("Failed to register rtcm_resyncs_total");
        registry
            .register(Box::new(active_subscribers.clone()))
            .expect("Failed to register active_subscribers");
        registry
            .register(Box::new(evictions.clone()))
            .expect("Failed to register subscriber_evictions_total");
        registry
            .register(Box::new(reconnects.clone()))
            .expect("Failed to register upstream_reconnects_total");

        Self {
            registry,
            bytes_received,
            bytes_sent,
            frames,
            crc_failures,
            resyncs,
            active_subscribers,
            evictions,
            reconnects,
        }
    }
}

/// Aggregate statistics for the relayed RTCM stream
pub struct Statistics {
    started_at: Instant,
    window: Duration,

    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    valid_frames: AtomicU64,
    crc_failures: AtomicU64,
    resyncs: AtomicU64,
    noise_bytes: AtomicU64,
    evictions: AtomicU64,
    reconnects: AtomicU64,

    message_counts: Mutex<BTreeMap<u16, u64>>,
    samples: Mutex<VecDeque<Sample>>,

    prometheus: PrometheusMetrics,
}

impl std::fmt::Debug for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statistics")
            .field("bytes_received", &self.bytes_received.load(Ordering::Relaxed))
            .field("valid_frames", &self.valid_frames.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Statistics {
    /// Create statistics with the default rate window
    pub fn new() -> Self {
        Self::with_window(DEFAULT_RATE_WINDOW)
    }

    /// Create statistics with a custom rate window
    pub fn with_window(window: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            window: window.max(Duration::from_secs(1)),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            valid_frames: AtomicU64::new(0),
            crc_failures: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            noise_bytes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            message_counts: Mutex::new(BTreeMap::new()),
            samples: Mutex::new(VecDeque::new()),
            prometheus: PrometheusMetrics::new(),
        }
    }

    /// Record bytes received from upstream
    pub fn record_bytes(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.prometheus.bytes_received.inc_by(bytes);
        self.push_sample(bytes, 0);
    }

    /// Record bytes written to a downstream client
    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.prometheus.bytes_sent.inc_by(bytes as u64);
    }

    /// Record a decoded frame. Only valid frames carrying a message number count.
    pub fn record_frame(&self, frame: &RtcmFrame) {
        if !frame.valid {
            return;
        }
        self.valid_frames.fetch_add(1, Ordering::Relaxed);
        self.push_sample(0, 1);

        if frame.length >= 2 {
            if let Ok(mut counts) = self.message_counts.lock() {
                *counts.entry(frame.message_type).or_insert(0) += 1;
            }
            self.prometheus
                .frames
                .with_label_values(&[&frame.message_type.to_string()])
                .inc();
        }
    }

    /// Record a CRC failure (always a resync event)
    pub fn record_crc_failure(&self) {
        self.crc_failures.fetch_add(1, Ordering::Relaxed);
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        self.prometheus.crc_failures.inc();
        self.prometheus.resyncs.inc();
    }

    /// Record bytes skipped before a preamble
    pub fn record_noise(&self, skipped: usize, new_resync: bool) {
        self.noise_bytes.fetch_add(skipped as u64, Ordering::Relaxed);
        if new_resync {
            self.resyncs.fetch_add(1, Ordering::Relaxed);
            self.prometheus.resyncs.inc();
        }
    }

    /// A subscriber joined the broadcast set
    pub fn subscriber_added(&self) {
        self.prometheus.active_subscribers.inc();
    }

    /// A subscriber left the broadcast set
    pub fn subscriber_removed(&self) {
        self.prometheus.active_subscribers.dec();
    }

    /// A subscriber was evicted for falling behind
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.prometheus.evictions.inc();
    }

    /// The supervisor is about to reconnect after a failure
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.prometheus.reconnects.inc();
    }

    /// Total bytes received from upstream
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Total bytes written to downstream clients
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Take a consistent copy of the current statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        let message_counts = self
            .message_counts
            .lock()
            .map(|counts| counts.clone())
            .unwrap_or_default();
        let (window_bytes, window_frames, window_secs) = self.window_totals();

        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            valid_frames: self.valid_frames.load(Ordering::Relaxed),
            crc_failures: self.crc_failures.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            noise_bytes: self.noise_bytes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            bytes_per_sec: window_bytes as f64 / window_secs,
            frames_per_sec: window_frames as f64 / window_secs,
            message_counts,
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    fn current_second(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn push_sample(&self, bytes: u64, frames: u64) {
        let second = self.current_second();
        let horizon = second.saturating_sub(self.window.as_secs());

        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        match samples.back_mut() {
            Some(last) if last.second == second => {
                last.bytes += bytes;
                last.frames += frames;
            }
            _ => samples.push_back(Sample { second, bytes, frames }),
        }
        while samples.front().is_some_and(|s| s.second < horizon) {
            samples.pop_front();
        }
    }

    /// Bytes and frames inside the window, plus the window length in seconds
    fn window_totals(&self) -> (u64, u64, f64) {
        let elapsed = self.started_at.elapsed();
        let second = elapsed.as_secs();
        let horizon = second.saturating_sub(self.window.as_secs());

        let (bytes, frames) = self
            .samples
            .lock()
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.second >= horizon)
                    .fold((0, 0), |(b, f), s| (b + s.bytes, f + s.frames))
            })
            .unwrap_or((0, 0));

        let span = elapsed.min(self.window).as_secs_f64().max(1.0);
        (bytes, frames, span)
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message_type: u16) -> RtcmFrame {
        let payload = [(message_type >> 4) as u8, ((message_type & 0x0F) << 4) as u8, 0x00];
        let raw = RtcmFrame::encode(&payload);
        RtcmFrame {
            message_type,
            length: payload.len(),
            raw,
            valid: true,
        }
    }

    #[test]
    fn test_counts_by_message_type() {
        let stats = Statistics::new();
        stats.record_frame(&frame(1074));
        stats.record_frame(&frame(1005));
        stats.record_frame(&frame(1074));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.valid_frames, 3);
        assert_eq!(snapshot.message_counts.get(&1074), Some(&2));
        assert_eq!(snapshot.message_counts.get(&1005), Some(&1));
    }

    #[test]
    fn test_invalid_frames_are_not_counted_by_type() {
        let stats = Statistics::new();
        let mut bad = frame(1077);
        bad.valid = false;
        stats.record_frame(&bad);
        stats.record_crc_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.valid_frames, 0);
        assert!(snapshot.message_counts.is_empty());
        assert_eq!(snapshot.crc_failures, 1);
        assert_eq!(snapshot.resyncs, 1);
    }

    #[test]
    fn test_rates_cover_recent_bytes() {
        let stats = Statistics::with_window(Duration::from_secs(5));
        stats.record_bytes(1000);
        stats.record_bytes(500);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_received, 1500);
        // Less than a second elapsed, so the span is clamped to one second
        assert_eq!(snapshot.bytes_per_sec, 1500.0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let stats = Statistics::new();
        stats.record_frame(&frame(1005));
        let before = stats.snapshot();
        stats.record_frame(&frame(1005));

        assert_eq!(before.message_counts.get(&1005), Some(&1));
        assert_eq!(stats.snapshot().message_counts.get(&1005), Some(&2));
    }

    #[test]
    fn test_prometheus_export() {
        let stats = Statistics::new();
        stats.record_bytes(42);
        stats.record_frame(&frame(1230));

        let output = stats.export_prometheus();
        assert!(output.contains("ntrip_relay_upstream_bytes_total 42"));
        assert!(output.contains("message_type=\"1230\""));
    }
}
