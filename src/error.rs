//! Error Types
//!
//! Typed failures for each relay component. None of these terminate the
//! process; each is recovered by the component that owns it.

use std::time::Duration;
use thiserror::Error;

/// Failures on the upstream side. Recovered by the reconnect supervisor.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The caster could not be reached at the network level.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// Connecting or completing the handshake took too long.
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    /// The caster answered, but not with a success status.
    #[error("handshake rejected: {reason} (status line: {status_line:?})")]
    Handshake { reason: String, status_line: String },
    /// Socket error while streaming.
    #[error("upstream i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The caster closed the stream.
    #[error("upstream closed the connection")]
    Closed,
    /// No bytes arrived for longer than the read timeout.
    #[error("no data from upstream for {0:?}")]
    Stalled(Duration),
}

impl UpstreamError {
    /// Raw status line returned by the caster, when there was one
    pub fn status_line(&self) -> Option<&str> {
        match self {
            UpstreamError::Handshake { status_line, .. } => Some(status_line),
            _ => None,
        }
    }
}

/// RTCM3 decode failures. Counted for observability, never propagated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("crc mismatch (computed {computed:#08x}, received {received:#08x})")]
    CrcMismatch { computed: u32, received: u32 },
    #[error("discarded {0} bytes of noise before preamble")]
    NoiseDiscarded(usize),
}

/// Reasons a downstream handshake is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("invalid or missing credentials")]
    Unauthorized,
    #[error("unknown mountpoint '{0}'")]
    UnknownMountpoint(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("client limit reached")]
    Unavailable,
}

/// Registration failures on the relay hub.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("subscriber {0} is already registered")]
    DuplicateSubscriber(u64),
}

/// Why the hub dropped a subscriber from the broadcast set.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The subscriber's queue was full when a chunk arrived.
    #[error("subscriber queue overflow")]
    QueueFull,
    /// The receiving side of the queue is gone.
    #[error("subscriber receiver dropped")]
    ReceiverGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_error_keeps_status_line() {
        let err = UpstreamError::Handshake {
            reason: "authentication failed".to_string(),
            status_line: "HTTP/1.1 401 Unauthorized".to_string(),
        };
        assert_eq!(err.status_line(), Some("HTTP/1.1 401 Unauthorized"));
        assert!(err.to_string().contains("401"));
        assert_eq!(UpstreamError::Closed.status_line(), None);
    }
}
