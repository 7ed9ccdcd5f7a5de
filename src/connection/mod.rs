//! Connection Management Module
//!
//! Accepts downstream NTRIP clients, runs the server-side handshake, and
//! streams relayed bytes to each client on its own task.

pub mod manager;

pub use manager::DownstreamServer;
