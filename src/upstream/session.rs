//! Upstream Session

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Connection state of one upstream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Streaming = 1,
    Failed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Streaming,
            _ => SessionState::Failed,
        }
    }
}

/// Shared, observable part of an upstream session.
///
/// A new one is created for every connection attempt; it is never reused.
#[derive(Debug)]
pub struct SessionInfo {
    pub session_id: String,
    pub remote: String,
    pub mountpoint: String,
    pub username: String,
    pub start_time: Instant,
    state: AtomicU8,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
    // Milliseconds since `start_time` plus one; zero means no data yet.
    last_activity: AtomicU64,
    status_line: OnceLock<String>,
}

/// Reporting view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub remote: String,
    pub mountpoint: String,
    pub username: String,
    pub state: SessionState,
    pub status_line: Option<String>,
    pub bytes_received: u64,
    pub messages_received: u64,
    pub duration_ms: u64,
    pub idle_ms: Option<u64>,
}

impl SessionInfo {
    /// Create a new session in the `Connecting` state
    pub fn new(remote: String, mountpoint: String, username: String) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!("Creating upstream session {} ({} /{})", session_id, remote, mountpoint);

        Self {
            session_id,
            remote,
            mountpoint,
            username,
            start_time: Instant::now(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            bytes_received: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
            status_line: OnceLock::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_status_line(&self, status_line: &str) {
        let _ = self.status_line.set(status_line.to_string());
    }

    pub fn status_line(&self) -> Option<&str> {
        self.status_line.get().map(String::as_str)
    }

    /// Add received bytes and touch the activity timestamp
    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        let now = self.start_time.elapsed().as_millis() as u64 + 1;
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn add_messages(&self, count: u64) {
        self.messages_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Take a reporting snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        let elapsed = self.start_time.elapsed().as_millis() as u64;
        let last = self.last_activity.load(Ordering::Relaxed);

        SessionSnapshot {
            session_id: self.session_id.clone(),
            remote: self.remote.clone(),
            mountpoint: self.mountpoint.clone(),
            username: self.username.clone(),
            state: self.state(),
            status_line: self.status_line().map(str::to_string),
            bytes_received: self.bytes_received(),
            messages_received: self.messages_received(),
            duration_ms: elapsed,
            idle_ms: (last > 0).then(|| elapsed.saturating_sub(last - 1)),
        }
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            remote = %self.remote,
            mountpoint = %self.mountpoint,
            duration_ms = self.duration().as_millis() as u64,
            bytes_received = self.bytes_received(),
            messages_received = self.messages_received(),
            "Upstream session ended"
        );
    }
}

/// A connected, handshaken upstream session
pub struct Session {
    info: Arc<SessionInfo>,
    stream: TcpStream,
    pending: Bytes,
}

impl Session {
    pub(crate) fn new(info: Arc<SessionInfo>, stream: TcpStream, pending: Bytes) -> Self {
        Self {
            info,
            stream,
            pending,
        }
    }

    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    /// Stream bytes that arrived together with the response head
    pub fn pending(&self) -> &Bytes {
        &self.pending
    }

    pub(crate) fn into_parts(self) -> (Arc<SessionInfo>, TcpStream, Bytes) {
        (self.info, self.stream, self.pending)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("pending", &self.pending.len())
            .finish()
    }
}
