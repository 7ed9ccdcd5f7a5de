//! ntrip-relay
//!
//! Pulls one RTCM3 correction stream from a remote NTRIP caster and re-serves
//! it, byte for byte, to any number of local NTRIP clients. The upstream
//! session is supervised with exponential backoff; clients that fall behind
//! are dropped without slowing anyone else down.

pub mod auth;
pub mod caster;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod rtcm;
pub mod shutdown;
pub mod supervisor;
pub mod upstream;

pub use caster::Caster;
pub use config::Config;
pub use connection::DownstreamServer;
pub use relay::RelayHub;
pub use rtcm::{FrameParser, RtcmFrame};
pub use shutdown::ShutdownCoordinator;
pub use supervisor::ReconnectSupervisor;
pub use upstream::UpstreamClient;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
