//! Upstream Module
//!
//! The single outbound connection to the remote caster: handshake, then a
//! read loop that pushes every received chunk into the relay hub and the
//! frame parser.

pub mod client;
pub mod session;

pub use client::UpstreamClient;
pub use session::{Session, SessionInfo, SessionSnapshot, SessionState};
