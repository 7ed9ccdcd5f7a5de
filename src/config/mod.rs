//! Configuration Module
//!
//! Handles configuration loading and validation. The configuration is
//! loaded once at startup and shared read-only afterwards.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
