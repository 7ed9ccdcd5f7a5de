//! Reconnect Supervisor Module
//!
//! Owns the upstream lifecycle: `Idle -> Connecting -> Streaming -> Failed`,
//! then back to `Connecting` after an exponential backoff.

pub mod backoff;
pub mod manager;

pub use backoff::ReconnectPolicy;
pub use manager::{AttemptOutcome, ReconnectSupervisor, SupervisorState, SupervisorStatus};
