//! Subscription descriptors and the options used to build them.

use crate::config::ConsumerConfig;
use crate::settlement::SettlementAdapter;
use pubsub_kit_core::error::RegistrationError;
use pubsub_kit_core::outcome::IntoOutcome;
use pubsub_kit_core::payload::{self, Payload};
use pubsub_kit_core::registry::EventTypeRegistry;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Identifies a subscription as a `(topic, subscription)` pair.
///
/// Renders and parses as `"topic|subscription"`, the form used by run filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    topic: String,
    subscription: String,
}

impl SubscriptionKey {
    /// Create a key.
    #[must_use]
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }

    /// Topic name
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscription name
    #[must_use]
    pub fn subscription(&self) -> &str {
        &self.subscription
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.topic, self.subscription)
    }
}

/// Error parsing a `"topic|subscription"` key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid subscription key '{0}', expected 'topic|subscription'")]
pub struct ParseSubscriptionKeyError(String);

impl FromStr for SubscriptionKey {
    type Err = ParseSubscriptionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('|') {
            Some((topic, subscription)) if !topic.is_empty() && !subscription.is_empty() => {
                Ok(Self::new(topic, subscription))
            }
            _ => Err(ParseSubscriptionKeyError(s.to_string())),
        }
    }
}

impl<T: Into<String>, S: Into<String>> From<(T, S)> for SubscriptionKey {
    fn from((topic, subscription): (T, S)) -> Self {
        Self::new(topic, subscription)
    }
}

/// Optional overrides for a registration.
///
/// Anything left unset is derived (topic from the handler name) or inherited
/// from the [`ConsumerConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Explicit topic name
    pub topic: Option<String>,
    /// Explicit subscription name
    pub subscription: Option<String>,
    /// Batch size override
    pub max_batch_size: Option<usize>,
    /// Batch wait override
    pub max_wait_time: Option<Duration>,
    /// Lock renewal override
    pub max_lock_renewal: Option<Duration>,
}

impl ConsumeOptions {
    /// No overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to an explicit topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Bind to an explicit subscription.
    #[must_use]
    pub fn subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    /// Override the batch size.
    #[must_use]
    pub const fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    /// Override the batch wait.
    #[must_use]
    pub const fn max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = Some(max_wait_time);
        self
    }

    /// Override the lock renewal limit.
    #[must_use]
    pub const fn max_lock_renewal(mut self, max_lock_renewal: Duration) -> Self {
        self.max_lock_renewal = Some(max_lock_renewal);
        self
    }
}

/// Builds the settlement adapter once topic and subscription are resolved.
pub(crate) type AdapterFactory = Box<
    dyn FnOnce(&EventTypeRegistry, &SubscriptionKey, &str) -> Result<SettlementAdapter, RegistrationError>
        + Send,
>;

/// A registration request: handler name, handler and overrides.
///
/// Passed to [`ConsumerApp::register`](crate::ConsumerApp::register).
pub struct SubscriptionSpec {
    pub(crate) handler_name: String,
    pub(crate) options: ConsumeOptions,
    pub(crate) factory: AdapterFactory,
}

impl SubscriptionSpec {
    /// Describe a handler.
    ///
    /// The handler's parameter type selects the payload conversion; its
    /// return type is any [`IntoOutcome`].
    pub fn new<P, F, Fut, R>(handler_name: impl Into<String>, handler: F) -> Self
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoOutcome + 'static,
    {
        let factory: AdapterFactory = Box::new(move |registry, key, handler_name| {
            let converter = payload::converter_for::<P>(registry, key.topic(), handler_name)?;
            Ok(SettlementAdapter::new(key.clone(), handler_name, converter, handler))
        });

        Self {
            handler_name: handler_name.into(),
            options: ConsumeOptions::default(),
            factory,
        }
    }

    /// Apply overrides.
    #[must_use]
    pub fn with_options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind to an explicit topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.options.topic = Some(topic.into());
        self
    }

    /// Bind to an explicit subscription.
    #[must_use]
    pub fn subscription(mut self, subscription: impl Into<String>) -> Self {
        self.options.subscription = Some(subscription.into());
        self
    }

    /// The handler name.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// The overrides.
    #[must_use]
    pub const fn options(&self) -> &ConsumeOptions {
        &self.options
    }
}

impl fmt::Debug for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSpec")
            .field("handler_name", &self.handler_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// An immutable, fully resolved subscription.
pub struct SubscriptionDescriptor {
    key: SubscriptionKey,
    handler_name: String,
    adapter: Arc<SettlementAdapter>,
    max_batch_size: Option<usize>,
    max_wait_time: Option<Duration>,
    max_lock_renewal: Option<Duration>,
}

impl SubscriptionDescriptor {
    pub(crate) fn new(
        key: SubscriptionKey,
        handler_name: String,
        adapter: SettlementAdapter,
        options: &ConsumeOptions,
    ) -> Self {
        Self {
            key,
            handler_name,
            adapter: Arc::new(adapter),
            max_batch_size: options.max_batch_size,
            max_wait_time: options.max_wait_time,
            max_lock_renewal: options.max_lock_renewal,
        }
    }

    /// The `(topic, subscription)` pair.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Topic name
    #[must_use]
    pub fn topic(&self) -> &str {
        self.key.topic()
    }

    /// Subscription name
    #[must_use]
    pub fn subscription(&self) -> &str {
        self.key.subscription()
    }

    /// The registered handler name.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// The batch size override, if any.
    #[must_use]
    pub const fn max_batch_size(&self) -> Option<usize> {
        self.max_batch_size
    }

    /// The batch wait override, if any.
    #[must_use]
    pub const fn max_wait_time(&self) -> Option<Duration> {
        self.max_wait_time
    }

    /// The lock renewal override, if any.
    #[must_use]
    pub const fn max_lock_renewal(&self) -> Option<Duration> {
        self.max_lock_renewal
    }

    pub(crate) fn adapter(&self) -> Arc<SettlementAdapter> {
        Arc::clone(&self.adapter)
    }

    /// Resolve overrides against engine defaults.
    #[must_use]
    pub fn settings(&self, config: &ConsumerConfig) -> RunnerSettings {
        RunnerSettings {
            max_batch_size: self.max_batch_size.unwrap_or(config.max_batch_size).max(1),
            max_wait_time: self.max_wait_time.unwrap_or(config.max_wait_time),
            max_lock_renewal: self.max_lock_renewal.unwrap_or(config.max_lock_renewal),
        }
    }
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("key", &self.key)
            .field("handler_name", &self.handler_name)
            .field("max_batch_size", &self.max_batch_size)
            .field("max_wait_time", &self.max_wait_time)
            .field("max_lock_renewal", &self.max_lock_renewal)
            .finish_non_exhaustive()
    }
}

/// Effective limits for one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Maximum number of messages per batch
    pub max_batch_size: usize,
    /// Maximum wait for a batch
    pub max_wait_time: Duration,
    /// Maximum total lock renewal per message
    pub max_lock_renewal: Duration,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let key = SubscriptionKey::new("task-created", "TEST_SUB");
        assert_eq!(key.to_string(), "task-created|TEST_SUB");
        assert_eq!("task-created|TEST_SUB".parse::<SubscriptionKey>().unwrap(), key);
        assert_eq!(SubscriptionKey::from(("task-created", "TEST_SUB")), key);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for raw in ["task-created", "|sub", "topic|", ""] {
            assert!(raw.parse::<SubscriptionKey>().is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn options_builder_sets_overrides() {
        let options = ConsumeOptions::new()
            .topic("orders")
            .subscription("billing")
            .max_batch_size(5)
            .max_wait_time(Duration::from_secs(1));
        assert_eq!(options.topic.as_deref(), Some("orders"));
        assert_eq!(options.subscription.as_deref(), Some("billing"));
        assert_eq!(options.max_batch_size, Some(5));
        assert_eq!(options.max_lock_renewal, None);
    }
}
