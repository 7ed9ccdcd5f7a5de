//! Stream Relay Module
//!
//! Fans the upstream byte stream out to every registered downstream subscriber.

pub mod hub;
pub mod subscriber;

pub use hub::RelayHub;
pub use subscriber::{Subscriber, SubscriberHandle, SubscriberId, SubscriberSnapshot, SubscriberState};
