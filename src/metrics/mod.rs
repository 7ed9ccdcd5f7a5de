//! Metrics Module
//!
//! Stream statistics, Prometheus export, the status endpoint and the periodic reporter.

pub mod collector;
pub mod reporter;
pub mod server;
pub mod types;

pub use collector::{Statistics, DEFAULT_RATE_WINDOW};
pub use reporter::{export_counts_csv, export_status_json, log_summary, StatsReporter};
pub use server::MetricsServer;
pub use types::{RelayStatus, StatsSnapshot, StatusSource, UpstreamStatus};
