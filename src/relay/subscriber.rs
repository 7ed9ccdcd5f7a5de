//! Relay Subscriber

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::hub::RelayHub;

/// Unique subscriber identifier
pub type SubscriberId = u64;

/// Lifecycle of one downstream subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SubscriberState {
    Handshaking = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

impl SubscriberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriberState::Handshaking,
            1 => SubscriberState::Active,
            2 => SubscriberState::Draining,
            _ => SubscriberState::Closed,
        }
    }
}

/// Shared state of one downstream connection
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    peer: Option<SocketAddr>,
    created_at: Instant,
    state: AtomicU8,
    bytes_delivered: AtomicU64,
    // Milliseconds since `created_at` of the last write, plus one; zero means never.
    last_send: AtomicU64,
}

/// Reporting view of a subscriber
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberSnapshot {
    pub id: SubscriberId,
    pub peer: Option<SocketAddr>,
    pub state: SubscriberState,
    pub bytes_delivered: u64,
    pub connected_secs: u64,
    pub idle_ms: Option<u64>,
}

impl Subscriber {
    /// Create a subscriber in the `Handshaking` state
    pub fn new(id: SubscriberId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            created_at: Instant::now(),
            state: AtomicU8::new(SubscriberState::Handshaking as u8),
            bytes_delivered: AtomicU64::new(0),
            last_send: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SubscriberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `Draining` unless the subscriber is already closed
    pub(crate) fn mark_draining(&self) {
        let _ = self.state.compare_exchange(
            SubscriberState::Active as u8,
            SubscriberState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Record bytes written to the client socket
    pub fn record_delivery(&self, bytes: usize) {
        self.bytes_delivered.fetch_add(bytes as u64, Ordering::Relaxed);
        let now = self.created_at.elapsed().as_millis() as u64 + 1;
        self.last_send.store(now, Ordering::Relaxed);
    }

    /// Total bytes written to the client socket
    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered.load(Ordering::Relaxed)
    }

    /// Take a reporting snapshot
    pub fn snapshot(&self) -> SubscriberSnapshot {
        let elapsed = self.created_at.elapsed();
        let last_send = self.last_send.load(Ordering::Relaxed);
        let idle_ms = (last_send > 0)
            .then(|| (elapsed.as_millis() as u64).saturating_sub(last_send - 1));

        SubscriberSnapshot {
            id: self.id,
            peer: self.peer,
            state: self.state(),
            bytes_delivered: self.bytes_delivered(),
            connected_secs: elapsed.as_secs(),
            idle_ms,
        }
    }
}

/// Receiving end of a registration.
///
/// Dropping the handle unregisters the subscriber from the hub.
pub struct SubscriberHandle {
    subscriber: Arc<Subscriber>,
    rx: mpsc::Receiver<Bytes>,
    hub: Arc<RelayHub>,
}

impl SubscriberHandle {
    pub(crate) fn new(subscriber: Arc<Subscriber>, rx: mpsc::Receiver<Bytes>, hub: Arc<RelayHub>) -> Self {
        Self { subscriber, rx, hub }
    }

    pub fn id(&self) -> SubscriberId {
        self.subscriber.id()
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Next queued chunk. `None` once the hub has dropped this subscriber and
    /// everything already queued has been drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Result<Bytes, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Whether the hub evicted this subscriber for falling behind
    pub fn is_draining(&self) -> bool {
        self.subscriber.state() == SubscriberState::Draining
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.hub.unregister(self.subscriber.id());
        self.subscriber.set_state(SubscriberState::Closed);
        debug!(subscriber_id = self.subscriber.id(), "Subscriber handle released");
    }
}
