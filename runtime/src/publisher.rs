//! Publishing state change events.
//!
//! The topic of an event is derived from its type name the same way consumers
//! derive it, so `publish(&TaskCreated { .. })` lands on `task-created`.

use crate::error::PublishError;
use crate::metrics::PublisherMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use pubsub_kit_core::bus::{BusConnection, MessageBus};
use pubsub_kit_core::error::BusError;
use pubsub_kit_core::event::EventType;
use pubsub_kit_core::naming;
use pubsub_kit_core::payload::RawPayload;
use std::sync::Arc;

/// Sends events over a bus connection.
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<dyn BusConnection>,
    retry: RetryPolicy,
}

impl Publisher {
    /// Open a connection and wrap it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the bus is unreachable.
    pub async fn connect(bus: &dyn MessageBus) -> Result<Self, BusError> {
        Ok(Self::new(bus.connect().await?))
    }

    /// Wrap an open connection. Sends are not retried by default.
    #[must_use]
    pub fn new(connection: Arc<dyn BusConnection>) -> Self {
        Self {
            connection,
            retry: RetryPolicy::no_retry(),
        }
    }

    /// Retry failed sends with backoff.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Publish an event to the topic derived from its type name.
    ///
    /// Returns the topic the event was sent to.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Topic`] if the type name yields no topic
    /// - [`PublishError::Bus`] if the send fails
    pub async fn publish<E: EventType>(&self, event: &E) -> Result<String, PublishError> {
        let topic = naming::topic_from_type_name(E::TYPE_NAME)?;
        self.publish_to(&topic, event).await?;
        Ok(topic)
    }

    /// Publish an event to an explicit topic.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the send fails.
    pub async fn publish_to<E: EventType>(&self, topic: &str, event: &E) -> Result<(), BusError> {
        self.publish_raw(topic, &event.to_raw()).await
    }

    /// Publish a raw JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the send fails.
    pub async fn publish_raw(&self, topic: &str, payload: &RawPayload) -> Result<(), BusError> {
        let body = payload.to_bytes();
        retry_with_backoff(&self.retry, "publish", || {
            self.connection.send(topic, body.clone())
        })
        .await?;

        PublisherMetrics::record_publish(topic);
        tracing::debug!(topic, bytes = body.len(), "Published message");
        Ok(())
    }

    /// Close the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the bus call fails.
    pub async fn close(&self) -> Result<(), BusError> {
        self.connection.close().await
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
