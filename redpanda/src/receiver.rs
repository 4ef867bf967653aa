//! Consumer-group receiver for one (topic, subscription) pair.

use crate::offsets::{OffsetTracker, Position};
use chrono::{DateTime, Utc};
use pubsub_kit_core::bus::{BusFuture, ReceivedMessage, Receiver};
use pubsub_kit_core::error::BusError;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// How long to keep filling a batch once its first message arrived.
const BATCH_LINGER: Duration = Duration::from_millis(50);

/// Header carrying the dead-letter reason.
pub const DEAD_LETTER_REASON_HEADER: &str = "dead-letter-reason";

/// Header carrying the subscription that rejected the message.
pub const DEAD_LETTER_SUBSCRIPTION_HEADER: &str = "dead-letter-subscription";

/// Topic that dead-lettered messages of `topic` are produced to.
#[must_use]
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dead-letter")
}

#[derive(Debug, Default)]
struct Inflight {
    offsets: OffsetTracker,
    positions: HashMap<String, Position>,
}

/// A [`Receiver`] backed by a Kafka consumer whose group id is the
/// subscription name.
///
/// Kafka has no per-message lock. `locked_until` is a logical window; the
/// partition stays assigned as long as the consumer keeps polling within
/// `max.poll.interval.ms`.
pub struct RedpandaReceiver {
    topic: String,
    subscription: String,
    consumer: StreamConsumer,
    producer: FutureProducer,
    inflight: Mutex<Inflight>,
    lock_duration: Duration,
    timeout: Duration,
}

impl RedpandaReceiver {
    pub(crate) fn new(
        topic: String,
        subscription: String,
        consumer: StreamConsumer,
        producer: FutureProducer,
        lock_duration: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            topic,
            subscription,
            consumer,
            producer,
            inflight: Mutex::new(Inflight::default()),
            lock_duration,
            timeout,
        }
    }

    fn inflight(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.lock_duration).unwrap_or(chrono::Duration::MAX)
    }

    fn accept(&self, message: &BorrowedMessage<'_>) -> ReceivedMessage {
        let position = Position {
            partition: message.partition(),
            offset: message.offset(),
        };
        let message_id = format!("{}:{}:{}", self.topic, position.partition, position.offset);
        let body = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

        let mut inflight = self.inflight();
        let delivery_count = inflight.offsets.track(position);
        inflight.positions.insert(message_id.clone(), position);
        drop(inflight);

        ReceivedMessage::new(message_id, body, self.lock_expiry()).with_delivery_count(delivery_count)
    }

    fn position(&self, message: &ReceivedMessage, action: &'static str) -> Result<Position, BusError> {
        self.inflight()
            .positions
            .get(&message.message_id)
            .copied()
            .ok_or_else(|| BusError::SettlementFailed {
                message_id: message.message_id.clone(),
                action,
                reason: "message is not in flight on this receiver".to_string(),
            })
    }

    /// Mark the message settled and commit whatever prefix became contiguous.
    fn settle(&self, message: &ReceivedMessage, action: &'static str) -> Result<(), BusError> {
        let position = self.position(message, action)?;
        let commit = {
            let mut inflight = self.inflight();
            inflight.positions.remove(&message.message_id);
            inflight.offsets.settle(position)
        };

        let Some(next_offset) = commit else {
            return Ok(());
        };

        let mut partitions = TopicPartitionList::new();
        partitions
            .add_partition_offset(&self.topic, position.partition, Offset::Offset(next_offset))
            .and_then(|()| self.consumer.commit(&partitions, CommitMode::Async))
            .map_err(|e| BusError::SettlementFailed {
                message_id: message.message_id.clone(),
                action,
                reason: format!("Failed to commit offset {next_offset}: {e}"),
            })?;

        tracing::trace!(
            topic = %self.topic,
            subscription = %self.subscription,
            partition = position.partition,
            offset = next_offset,
            "Committed offset"
        );
        Ok(())
    }
}

impl Receiver for RedpandaReceiver {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscription(&self) -> &str {
        &self.subscription
    }

    fn receive_batch(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BusFuture<'_, Vec<ReceivedMessage>> {
        Box::pin(async move {
            let mut batch = Vec::with_capacity(max_messages);
            let deadline = Instant::now() + max_wait;

            while batch.len() < max_messages {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let wait = if batch.is_empty() {
                    remaining
                } else {
                    remaining.min(BATCH_LINGER)
                };

                match tokio::time::timeout(wait, self.consumer.recv()).await {
                    Err(_) => break,
                    Ok(Ok(message)) => batch.push(self.accept(&message)),
                    Ok(Err(e)) if batch.is_empty() => {
                        return Err(BusError::ReceiveFailed(format!(
                            "Failed to receive from '{}': {e}",
                            self.topic
                        )));
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(
                            topic = %self.topic,
                            subscription = %self.subscription,
                            error = %e,
                            "Receive failed mid-batch, returning partial batch"
                        );
                        break;
                    }
                }
            }

            Ok(batch)
        })
    }

    fn complete<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, ()> {
        Box::pin(async move { self.settle(message, "complete") })
    }

    fn abandon<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let position = self.position(message, "abandon")?;
            self.inflight().positions.remove(&message.message_id);

            // Rewind so the offset (and everything after it) is delivered again.
            self.consumer
                .seek(
                    &self.topic,
                    position.partition,
                    Offset::Offset(position.offset),
                    Timeout::After(self.timeout),
                )
                .map_err(|e| BusError::SettlementFailed {
                    message_id: message.message_id.clone(),
                    action: "abandon",
                    reason: format!("Failed to seek back: {e}"),
                })
        })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        reason: &'a str,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            self.position(message, "dead_letter")?;

            let topic = dead_letter_topic(&self.topic);
            let headers = OwnedHeaders::new()
                .insert(Header {
                    key: DEAD_LETTER_REASON_HEADER,
                    value: Some(reason),
                })
                .insert(Header {
                    key: DEAD_LETTER_SUBSCRIPTION_HEADER,
                    value: Some(self.subscription.as_str()),
                });
            let record = FutureRecord::to(&topic)
                .payload(&message.body)
                .key(&message.message_id)
                .headers(headers);

            self.producer
                .send(record, Timeout::After(self.timeout))
                .await
                .map_err(|(e, _)| BusError::SettlementFailed {
                    message_id: message.message_id.clone(),
                    action: "dead_letter",
                    reason: format!("Failed to produce to '{topic}': {e}"),
                })?;

            self.settle(message, "dead_letter")
        })
    }

    fn renew_lock<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, DateTime<Utc>> {
        Box::pin(async move {
            let in_flight = {
                let inflight = self.inflight();
                inflight
                    .positions
                    .get(&message.message_id)
                    .is_some_and(|position| inflight.offsets.is_in_flight(*position))
            };
            if !in_flight {
                return Err(BusError::LockRenewalFailed {
                    message_id: message.message_id.clone(),
                    reason: "message is not in flight on this receiver".to_string(),
                });
            }
            Ok(self.lock_expiry())
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.consumer.unsubscribe();
            tracing::debug!(
                topic = %self.topic,
                subscription = %self.subscription,
                "Receiver closed"
            );
            Ok(())
        })
    }
}
