//! Redpanda message bus for pubsub-kit.
//!
//! Implements the [`MessageBus`] collaborator over any Kafka-compatible
//! broker (Redpanda, Apache Kafka, MSK, Event Hubs) through rdkafka.
//!
//! # Mapping
//!
//! | Bus concept          | Kafka                                                     |
//! |----------------------|-----------------------------------------------------------|
//! | topic                | topic                                                     |
//! | subscription         | consumer group (`group.id`)                               |
//! | complete             | commit the next offset once every earlier one is settled  |
//! | abandon              | seek the partition back to the message                    |
//! | dead-letter          | produce to `{topic}.dead-letter`, then commit             |
//! | lock renewal         | extend a logical lock window                              |
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual commits. Abandoning a message rewinds its
//! partition, so later messages of the same partition may be redelivered
//! too. Handlers must be idempotent.
//!
//! # Example
//!
//! ```no_run
//! use pubsub_kit_redpanda::RedpandaBus;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBus::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .lock_duration(Duration::from_secs(60))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod offsets;
mod receiver;

pub use receiver::{
    DEAD_LETTER_REASON_HEADER, DEAD_LETTER_SUBSCRIPTION_HEADER, RedpandaReceiver,
    dead_letter_topic,
};

use pubsub_kit_core::bus::{BusConnection, BusFuture, MessageBus, Receiver};
use pubsub_kit_core::error::BusError;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the bootstrap servers.
pub const BROKERS_VAR: &str = "REDPANDA_BROKERS";
/// Environment variable holding the security protocol.
pub const SECURITY_PROTOCOL_VAR: &str = "REDPANDA_SECURITY_PROTOCOL";
/// Environment variable holding the SASL mechanism.
pub const SASL_MECHANISM_VAR: &str = "REDPANDA_SASL_MECHANISM";
/// Environment variable holding the SASL username.
pub const SASL_USERNAME_VAR: &str = "REDPANDA_SASL_USERNAME";
/// Environment variable holding the SASL password.
pub const SASL_PASSWORD_VAR: &str = "REDPANDA_SASL_PASSWORD";

/// Redpanda message bus.
///
/// Holds connection settings only; [`MessageBus::connect`] creates the
/// producer and checks that a broker answers.
///
/// # Configuration
///
/// - **Brokers**: bootstrap servers (required)
/// - **Security**: protocol and SASL credentials
/// - **Producer**: acks, compression, send timeout
/// - **Consumer**: offset reset for new subscriptions, logical lock window
#[derive(Clone)]
pub struct RedpandaBus {
    brokers: String,
    security_protocol: Option<String>,
    sasl_mechanism: Option<String>,
    sasl_credentials: Option<(String, String)>,
    producer_acks: String,
    compression: String,
    timeout: Duration,
    auto_offset_reset: String,
    lock_duration: Duration,
}

impl RedpandaBus {
    /// Create a bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if `brokers` is empty.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaBusBuilder {
        RedpandaBusBuilder::default()
    }

    /// Configure the bus from `REDPANDA_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if `REDPANDA_BROKERS` is unset.
    pub fn from_env() -> Result<Self, BusError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Configure the bus through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Same as [`RedpandaBus::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let brokers = lookup(BROKERS_VAR)
            .ok_or_else(|| BusError::ConnectionFailed(format!("{BROKERS_VAR} is not set")))?;

        let mut builder = Self::builder().brokers(brokers);
        if let Some(protocol) = lookup(SECURITY_PROTOCOL_VAR) {
            builder = builder.security_protocol(protocol);
        }
        if let Some(mechanism) = lookup(SASL_MECHANISM_VAR) {
            builder = builder.sasl_mechanism(mechanism);
        }
        if let (Some(username), Some(password)) =
            (lookup(SASL_USERNAME_VAR), lookup(SASL_PASSWORD_VAR))
        {
            builder = builder.sasl_credentials(username, password);
        }
        builder.build()
    }

    /// The bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Base client configuration shared by producers and consumers.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        if let Some(protocol) = &self.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some((username, password)) = &self.sasl_credentials {
            config
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .set("acks", &self.producer_acks)
            .set("compression.type", &self.compression);
        config
    }

    fn consumer_config(&self, subscription: &str) -> ClientConfig {
        let mut config = self.client_config();
        config
            .set("group.id", subscription)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        config
    }
}

impl std::fmt::Debug for RedpandaBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBus")
            .field("brokers", &self.brokers)
            .field("security_protocol", &self.security_protocol)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("producer_acks", &self.producer_acks)
            .field("compression", &self.compression)
            .field("timeout", &self.timeout)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("lock_duration", &self.lock_duration)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RedpandaBus`].
///
/// # Example
///
/// ```no_run
/// use pubsub_kit_redpanda::RedpandaBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaBus::builder()
///     .brokers("broker-1:9092,broker-2:9092")
///     .security_protocol("SASL_SSL")
///     .sasl_mechanism("SCRAM-SHA-256")
///     .sasl_credentials("consumer", "secret")
///     .auto_offset_reset("earliest")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaBusBuilder {
    brokers: Option<String>,
    security_protocol: Option<String>,
    sasl_mechanism: Option<String>,
    sasl_credentials: Option<(String, String)>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    lock_duration: Option<Duration>,
}

impl RedpandaBusBuilder {
    /// Set the comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the security protocol (`plaintext`, `ssl`, `sasl_plaintext`, `sasl_ssl`).
    #[must_use]
    pub fn security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Set the SASL mechanism (`PLAIN`, `SCRAM-SHA-256`, `SCRAM-SHA-512`).
    #[must_use]
    pub fn sasl_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.sasl_mechanism = Some(mechanism.into());
        self
    }

    /// Set the SASL username and password.
    #[must_use]
    pub fn sasl_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.sasl_credentials = Some((username.into(), password.into()));
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec.
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the timeout for sends, seeks and metadata requests.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set where a new subscription starts reading: "earliest" or "latest".
    ///
    /// Default: "earliest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the logical lock window reported for received messages.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub const fn lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = Some(lock_duration);
        self
    }

    /// Build the [`RedpandaBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if no brokers are configured.
    pub fn build(self) -> Result<RedpandaBus, BusError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;

        Ok(RedpandaBus {
            brokers,
            security_protocol: self.security_protocol,
            sasl_mechanism: self.sasl_mechanism,
            sasl_credentials: self.sasl_credentials,
            producer_acks: self.producer_acks.unwrap_or_else(|| "all".to_string()),
            compression: self.compression.unwrap_or_else(|| "none".to_string()),
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            lock_duration: self.lock_duration.unwrap_or(Duration::from_secs(30)),
        })
    }
}

impl MessageBus for RedpandaBus {
    fn connect(&self) -> BusFuture<'_, Arc<dyn BusConnection>> {
        Box::pin(async move {
            let producer: FutureProducer = self.producer_config().create().map_err(|e| {
                BusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

            // Metadata requests block; keep them off the runtime threads.
            let probe = producer.clone();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, timeout))
                .await
                .map_err(|e| BusError::ConnectionFailed(format!("Metadata probe aborted: {e}")))?
                .map_err(|e| {
                    BusError::ConnectionFailed(format!("No broker reachable at {}: {e}", self.brokers))
                })?;

            tracing::info!(
                brokers = %self.brokers,
                acks = %self.producer_acks,
                compression = %self.compression,
                auto_offset_reset = %self.auto_offset_reset,
                "Connected to Redpanda"
            );

            Ok(Arc::new(RedpandaConnection {
                bus: self.clone(),
                producer,
            }) as Arc<dyn BusConnection>)
        })
    }
}

/// An open connection: a shared producer plus the settings to create
/// receivers.
pub struct RedpandaConnection {
    bus: RedpandaBus,
    producer: FutureProducer,
}

impl BusConnection for RedpandaConnection {
    fn receiver<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
    ) -> BusFuture<'a, Arc<dyn Receiver>> {
        Box::pin(async move {
            let receiver_error = |reason: String| BusError::ReceiverFailed {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
                reason,
            };

            let consumer: StreamConsumer = self
                .bus
                .consumer_config(subscription)
                .create()
                .map_err(|e| receiver_error(format!("Failed to create consumer: {e}")))?;
            consumer
                .subscribe(&[topic])
                .map_err(|e| receiver_error(format!("Failed to subscribe: {e}")))?;

            tracing::info!(
                topic,
                subscription,
                auto_offset_reset = %self.bus.auto_offset_reset,
                "Opened receiver"
            );

            Ok(Arc::new(RedpandaReceiver::new(
                topic.to_string(),
                subscription.to_string(),
                consumer,
                self.producer.clone(),
                self.bus.lock_duration,
                self.bus.timeout,
            )) as Arc<dyn Receiver>)
        })
    }

    fn send<'a>(&'a self, topic: &'a str, body: Vec<u8>) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let record: FutureRecord<'_, (), Vec<u8>> = FutureRecord::to(topic).payload(&body);
            match self
                .producer
                .send(record, Timeout::After(self.bus.timeout))
                .await
            {
                Ok((partition, offset)) => {
                    tracing::debug!(topic, partition, offset, "Message produced");
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic, error = %kafka_error, "Failed to produce message");
                    Err(BusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            let producer = self.producer.clone();
            let timeout = self.bus.timeout;
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| BusError::TransportError(format!("Flush aborted: {e}")))?
                .map_err(|e| BusError::TransportError(format!("Failed to flush producer: {e}")))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn redpanda_bus_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<RedpandaBus>();
        assert_send_sync::<RedpandaConnection>();
        assert_send_sync::<RedpandaReceiver>();
    }

    #[test]
    fn builder_requires_brokers() {
        assert!(matches!(
            RedpandaBus::builder().build(),
            Err(BusError::ConnectionFailed(_))
        ));
        assert!(RedpandaBus::new("  ").is_err());
    }

    #[test]
    fn builder_defaults() {
        let bus = RedpandaBus::new("localhost:9092").unwrap();
        assert_eq!(bus.brokers(), "localhost:9092");
        assert_eq!(bus.producer_acks, "all");
        assert_eq!(bus.auto_offset_reset, "earliest");
        assert_eq!(bus.lock_duration, Duration::from_secs(30));
        assert!(bus.client_config().get("security.protocol").is_none());
    }

    #[test]
    fn env_configures_security() {
        let bus = RedpandaBus::from_lookup(lookup(&[
            (BROKERS_VAR, "broker:9093"),
            (SECURITY_PROTOCOL_VAR, "SASL_SSL"),
            (SASL_MECHANISM_VAR, "SCRAM-SHA-512"),
            (SASL_USERNAME_VAR, "svc"),
            (SASL_PASSWORD_VAR, "pw"),
        ]))
        .unwrap();

        let config = bus.client_config();
        assert_eq!(config.get("bootstrap.servers"), Some("broker:9093"));
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(config.get("sasl.username"), Some("svc"));
        assert_eq!(config.get("sasl.password"), Some("pw"));
    }

    #[test]
    fn env_requires_brokers() {
        let result = RedpandaBus::from_lookup(lookup(&[(SECURITY_PROTOCOL_VAR, "SSL")]));
        assert!(matches!(result, Err(BusError::ConnectionFailed(_))));
    }

    #[test]
    fn subscriptions_map_to_consumer_groups() {
        let bus = RedpandaBus::new("localhost:9092").unwrap();
        let config = bus.consumer_config("TEST_SUB");
        assert_eq!(config.get("group.id"), Some("TEST_SUB"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn dead_letter_topic_is_suffixed() {
        assert_eq!(dead_letter_topic("task-created"), "task-created.dead-letter");
    }
}
