//! Message bus abstraction.
//!
//! The consumer engine talks to a topic/subscription message bus through three
//! traits:
//!
//! ```text
//! MessageBus ──connect──▶ BusConnection ──receiver(topic, subscription)──▶ Receiver
//!                               │                                            │
//!                               └── send(topic, body)                        ├── receive_batch
//!                                                                            ├── complete / abandon / dead_letter
//!                                                                            └── renew_lock
//! ```
//!
//! # Delivery semantics
//!
//! - **Peek-lock**: a received message is locked to the receiver until
//!   `locked_until`. It must be settled exactly once before the lock expires,
//!   otherwise the bus redelivers it.
//! - **At-least-once**: handlers may see the same message more than once.
//! - **Competing consumers**: receivers on the same subscription share its
//!   messages; every subscription on a topic receives its own copy.
//!
//! # Implementations
//!
//! - `InMemoryBus` in `pubsub-kit-testing` - scriptable, for tests
//! - `RedpandaBus` in `pubsub-kit-redpanda` - Kafka-compatible brokers
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! traits can be used as `Arc<dyn Receiver>` and `&dyn MessageBus`.

use crate::error::BusError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future returned by bus operations.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

/// A message received under a peek-lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Bus-assigned message id
    pub message_id: String,

    /// Raw message body
    pub body: Vec<u8>,

    /// When the current lock expires
    pub locked_until: DateTime<Utc>,

    /// How many times the message has been delivered, starting at 1
    pub delivery_count: u32,
}

impl ReceivedMessage {
    /// Create a first-delivery message.
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        body: impl Into<Vec<u8>>,
        locked_until: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            locked_until,
            delivery_count: 1,
        }
    }

    /// Set the delivery count.
    #[must_use]
    pub const fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }
}

/// A receiver bound to one (topic, subscription) pair.
pub trait Receiver: Send + Sync {
    /// The topic this receiver reads from.
    fn topic(&self) -> &str;

    /// The subscription this receiver reads from.
    fn subscription(&self) -> &str;

    /// Receive up to `max_messages`, waiting at most `max_wait` for the first.
    ///
    /// An empty batch means nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ReceiveFailed`] if the bus call fails.
    fn receive_batch(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BusFuture<'_, Vec<ReceivedMessage>>;

    /// Remove a message from the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SettlementFailed`] if the bus call fails.
    fn complete<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, ()>;

    /// Release a message's lock so the bus redelivers it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SettlementFailed`] if the bus call fails.
    fn abandon<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, ()>;

    /// Move a message to the dead-letter side channel.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SettlementFailed`] if the bus call fails.
    fn dead_letter<'a>(&'a self, message: &'a ReceivedMessage, reason: &'a str)
    -> BusFuture<'a, ()>;

    /// Extend a message's lock, returning the new expiry.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::LockRenewalFailed`] if the bus call fails.
    fn renew_lock<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, DateTime<Utc>>;

    /// Release the receiver.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TransportError`] if the bus call fails.
    fn close(&self) -> BusFuture<'_, ()>;
}

/// An open connection to the bus.
pub trait BusConnection: Send + Sync {
    /// Open a receiver for a (topic, subscription) pair.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ReceiverFailed`] if the receiver cannot be opened.
    fn receiver<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
    ) -> BusFuture<'a, Arc<dyn Receiver>>;

    /// Send a message body to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the send fails.
    fn send<'a>(&'a self, topic: &'a str, body: Vec<u8>) -> BusFuture<'a, ()>;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TransportError`] if the bus call fails.
    fn close(&self) -> BusFuture<'_, ()>;
}

/// Entry point to a message bus.
pub trait MessageBus: Send + Sync {
    /// Open a connection.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the bus is unreachable.
    fn connect(&self) -> BusFuture<'_, Arc<dyn BusConnection>>;
}
