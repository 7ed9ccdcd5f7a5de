//! Relay Hub
//!
//! Fan-out point between the single upstream producer and every registered
//! downstream subscriber. Membership changes and the enqueue pass share one
//! lock; draining a queue and writing to a socket happen outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::subscriber::{Subscriber, SubscriberHandle, SubscriberId, SubscriberSnapshot, SubscriberState};
use crate::error::{EvictionReason, HubError};
use crate::metrics::Statistics;

/// Default per-subscriber queue capacity, in broadcast chunks
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct SubscriberEntry {
    subscriber: Arc<Subscriber>,
    tx: mpsc::Sender<Bytes>,
}

/// Registry of active subscribers and broadcast entry point
pub struct RelayHub {
    subscribers: Mutex<HashMap<SubscriberId, SubscriberEntry>>,
    queue_capacity: usize,
    next_id: AtomicU64,
    stats: Arc<Statistics>,
}

impl RelayHub {
    /// Create a hub whose subscribers each get a queue of `queue_capacity` chunks
    pub fn new(queue_capacity: usize, stats: Arc<Statistics>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            stats,
        }
    }

    /// Create a hub from configuration
    pub fn from_config(config: &crate::config::Config, stats: Arc<Statistics>) -> Self {
        Self::new(config.server.queue_capacity, stats)
    }

    /// Allocate a fresh subscriber id
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a new subscriber under `id`
    pub fn register(self: &Arc<Self>, id: SubscriberId) -> Result<SubscriberHandle, HubError> {
        self.register_subscriber(Arc::new(Subscriber::new(id, None)))
    }

    /// Register a subscriber created by the downstream server
    pub fn register_subscriber(
        self: &Arc<Self>,
        subscriber: Arc<Subscriber>,
    ) -> Result<SubscriberHandle, HubError> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = subscriber.id();

        {
            let mut subscribers = self.lock();
            if subscribers.contains_key(&id) {
                return Err(HubError::DuplicateSubscriber(id));
            }
            subscriber.set_state(SubscriberState::Active);
            subscribers.insert(
                id,
                SubscriberEntry {
                    subscriber: Arc::clone(&subscriber),
                    tx,
                },
            );
            self.stats.subscriber_added();

            info!(
                subscriber_id = id,
                peer = ?subscriber.peer(),
                subscribers = subscribers.len(),
                "Subscriber registered"
            );
        }

        Ok(SubscriberHandle::new(subscriber, rx, Arc::clone(self)))
    }

    /// Remove a subscriber. Returns `false` if it was not registered (already
    /// unregistered or evicted), so cleanup runs at most once.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = {
            let mut subscribers = self.lock();
            let removed = subscribers.remove(&id);
            if removed.is_some() {
                debug!(subscriber_id = id, subscribers = subscribers.len(), "Subscriber unregistered");
            }
            removed
        };

        match removed {
            Some(entry) => {
                entry.subscriber.set_state(SubscriberState::Closed);
                self.stats.subscriber_removed();
                true
            }
            None => false,
        }
    }

    /// Push a chunk to every active subscriber without waiting.
    ///
    /// A subscriber whose queue is full is evicted: it stops receiving, its
    /// queue sender is dropped so the connection drains what is already queued
    /// and then closes. Returns the number of subscribers the chunk reached.
    pub fn broadcast(&self, chunk: Bytes) -> usize {
        if chunk.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut evicted: Vec<(SubscriberId, EvictionReason)> = Vec::new();

        let mut subscribers = self.lock();
        for (id, entry) in subscribers.iter() {
            match entry.tx.try_send(chunk.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => evicted.push((*id, EvictionReason::QueueFull)),
                Err(TrySendError::Closed(_)) => evicted.push((*id, EvictionReason::ReceiverGone)),
            }
        }

        for (id, reason) in evicted {
            if let Some(entry) = subscribers.remove(&id) {
                entry.subscriber.mark_draining();
                self.stats.subscriber_removed();
                if reason == EvictionReason::QueueFull {
                    self.stats.record_eviction();
                    warn!(
                        subscriber_id = id,
                        peer = ?entry.subscriber.peer(),
                        capacity = self.queue_capacity,
                        "Evicting slow subscriber: {}", reason
                    );
                } else {
                    debug!(subscriber_id = id, "Dropping subscriber: {}", reason);
                }
            }
        }

        delivered
    }

    /// Drop every subscriber. Connections drain their queues and close.
    pub fn close_all(&self) -> usize {
        let drained: Vec<SubscriberEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.subscriber.mark_draining();
            self.stats.subscriber_removed();
        }
        if !drained.is_empty() {
            info!("Released {} subscribers", drained.len());
        }
        drained.len()
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether `id` is currently registered
    pub fn is_registered(&self, id: SubscriberId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Reporting snapshots of the registered subscribers, ordered by id
    pub fn subscribers(&self) -> Vec<SubscriberSnapshot> {
        let mut snapshots: Vec<SubscriberSnapshot> = self
            .lock()
            .values()
            .map(|entry| entry.subscriber.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, SubscriberEntry>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
