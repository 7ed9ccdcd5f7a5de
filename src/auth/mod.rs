//! Authentication Module
//!
//! Downstream handshake checks: requested mountpoint and HTTP Basic credentials.

pub mod manager;
pub mod types;

pub use manager::AuthManager;
pub use types::{constant_time_eq, AccessGrant, AuthStats, AuthStatsSnapshot, Credentials};
