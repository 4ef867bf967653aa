//! The consumer engine and its registration API.
//!
//! # Registration
//!
//! ```text
//! consume("on_task_created", handler)              topic: task-created (derived)
//! consume_with(options).bind("on_x", handler)      topic/subscription from options
//! register(SubscriptionSpec::new(..))              plain descriptor registration
//! consume!(app, on_task_created)                   name captured from the identifier
//! ```
//!
//! All forms produce the same [`SubscriptionDescriptor`].
//!
//! # Running
//!
//! [`ConsumerApp::run`] connects once, opens one receiver per subscription
//! and drives every [`SubscriptionRunner`] concurrently. [`ConsumerApp::cancel`]
//! (or a [`ShutdownHandle`]) sets a flag each runner checks between batches,
//! so in-flight batches are always settled before `run` returns.
//!
//! Dropping the `run` future instead (for example under `tokio::time::timeout`)
//! abandons in-flight handlers, but the connection and receivers are still
//! closed on a spawned task.

use crate::config::ConsumerConfig;
use crate::error::ConsumerError;
use crate::runner::SubscriptionRunner;
use crate::shutdown::{CloseGuard, ShutdownHandle};
use crate::subscription::{ConsumeOptions, SubscriptionDescriptor, SubscriptionKey, SubscriptionSpec};
use futures::future::join_all;
use pubsub_kit_core::bus::{BusConnection, MessageBus, Receiver};
use pubsub_kit_core::error::RegistrationError;
use pubsub_kit_core::event::EventType;
use pubsub_kit_core::naming;
use pubsub_kit_core::outcome::IntoOutcome;
use pubsub_kit_core::payload::Payload;
use pubsub_kit_core::registry::EventTypeRegistry;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Register a handler, capturing its identifier as the handler name.
///
/// ```ignore
/// consume!(app, on_task_created)?;
/// consume!(app, handlers::on_sample_event, topic = "sample", subscription = "audit")?;
/// ```
///
/// Extra `key = value` pairs call the matching [`ConsumeOptions`] setter.
#[macro_export]
macro_rules! consume {
    ($app:expr, $handler:path $(,)?) => {
        $app.consume(::core::stringify!($handler), $handler)
    };
    ($app:expr, $handler:path, $($option:ident = $value:expr),+ $(,)?) => {
        $app.consume_with($crate::subscription::ConsumeOptions::new() $(.$option($value))+)
            .bind(::core::stringify!($handler), $handler)
    };
}

/// Completes a parameterized registration started by [`ConsumerApp::consume_with`].
#[must_use = "call bind to register the handler"]
pub struct ConsumeBinder<'a> {
    app: &'a mut ConsumerApp,
    options: ConsumeOptions,
}

impl ConsumeBinder<'_> {
    /// Register `handler` under `handler_name` with the captured options.
    ///
    /// # Errors
    ///
    /// See [`ConsumerApp::register`].
    pub fn bind<P, F, Fut, R>(
        self,
        handler_name: impl Into<String>,
        handler: F,
    ) -> Result<SubscriptionKey, RegistrationError>
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoOutcome + 'static,
    {
        self.app
            .register(SubscriptionSpec::new(handler_name, handler).with_options(self.options))
    }
}

/// Owns the event type registry and the subscriptions, and runs them.
pub struct ConsumerApp {
    config: ConsumerConfig,
    registry: EventTypeRegistry,
    descriptors: Vec<SubscriptionDescriptor>,
    shutdown: ShutdownHandle,
    running: AtomicBool,
}

impl ConsumerApp {
    /// Create an app with an empty event type registry.
    #[must_use]
    pub fn new(config: ConsumerConfig) -> Self {
        Self::with_registry(config, EventTypeRegistry::new())
    }

    /// Create an app around an existing event type registry.
    #[must_use]
    pub fn with_registry(config: ConsumerConfig, registry: EventTypeRegistry) -> Self {
        Self {
            config,
            registry,
            descriptors: Vec::new(),
            shutdown: ShutdownHandle::new(),
            running: AtomicBool::new(false),
        }
    }

    /// The engine-wide configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// The event type registry.
    #[must_use]
    pub const fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    /// Register an event type under its derived topic.
    ///
    /// # Errors
    ///
    /// See [`EventTypeRegistry::register`].
    pub fn register_event_type<E: EventType>(&mut self) -> Result<String, RegistrationError> {
        self.registry.register::<E>()
    }

    /// Register an event type under an explicit topic.
    ///
    /// # Errors
    ///
    /// See [`EventTypeRegistry::register_for_topic`].
    pub fn register_event_type_for_topic<E: EventType>(
        &mut self,
        topic: impl Into<String>,
    ) -> Result<String, RegistrationError> {
        self.registry.register_for_topic::<E>(topic)
    }

    /// Register a handler whose topic is derived from its name.
    ///
    /// # Errors
    ///
    /// See [`ConsumerApp::register`].
    pub fn consume<P, F, Fut, R>(
        &mut self,
        handler_name: impl Into<String>,
        handler: F,
    ) -> Result<SubscriptionKey, RegistrationError>
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoOutcome + 'static,
    {
        self.register(SubscriptionSpec::new(handler_name, handler))
    }

    /// Start a registration with explicit options; finish it with
    /// [`ConsumeBinder::bind`].
    pub fn consume_with(&mut self, options: ConsumeOptions) -> ConsumeBinder<'_> {
        ConsumeBinder { app: self, options }
    }

    /// Register a subscription.
    ///
    /// The topic defaults to the one derived from the handler name and the
    /// subscription to the configured default.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::NamingConvention`] if no topic is given and the
    ///   handler name is not `on_<entity>_<event>`
    /// - [`RegistrationError::EmptyName`] for an empty topic or subscription
    /// - [`RegistrationError::DuplicateSubscription`] if the pair is taken
    /// - [`RegistrationError::UnknownEventType`] or
    ///   [`RegistrationError::UnsupportedPayloadType`] if the handler's payload
    ///   type cannot be resolved
    pub fn register(&mut self, spec: SubscriptionSpec) -> Result<SubscriptionKey, RegistrationError> {
        let SubscriptionSpec {
            handler_name,
            options,
            factory,
        } = spec;

        let topic = match &options.topic {
            Some(topic) => topic.clone(),
            None => naming::topic_from_handler_name(&handler_name)?,
        };
        let subscription = options
            .subscription
            .clone()
            .unwrap_or_else(|| self.config.default_subscription_name.clone());
        if topic.is_empty() {
            return Err(RegistrationError::EmptyName("topic"));
        }
        if subscription.is_empty() {
            return Err(RegistrationError::EmptyName("subscription"));
        }

        let key = SubscriptionKey::new(topic, subscription);
        if self.descriptors.iter().any(|d| d.key() == &key) {
            return Err(RegistrationError::DuplicateSubscription {
                topic: key.topic().to_string(),
                subscription: key.subscription().to_string(),
            });
        }

        let adapter = factory(&self.registry, &key, handler_name.as_str())?;
        tracing::info!(
            topic = key.topic(),
            subscription = key.subscription(),
            handler = %handler_name,
            "Registered subscription"
        );
        self.descriptors.push(SubscriptionDescriptor::new(
            key.clone(),
            handler_name,
            adapter,
            &options,
        ));
        Ok(key)
    }

    /// The registered subscriptions, in registration order.
    pub fn subscriptions(&self) -> impl Iterator<Item = &SubscriptionDescriptor> {
        self.descriptors.iter()
    }

    /// A handle that can cancel this app from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Ask every runner to stop after its current batch.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run every subscription until cancelled.
    ///
    /// # Errors
    ///
    /// See [`ConsumerApp::run_filtered`].
    pub async fn run(&self, bus: &dyn MessageBus) -> Result<(), ConsumerError> {
        self.run_filtered(bus, None).await
    }

    /// Run the subscriptions whose keys are in `filter` (all if `None`).
    ///
    /// Returns once every runner has stopped. The connection and receivers
    /// are closed on every path after they were opened, including when this
    /// future is dropped before it completes.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::NoSubscriptions`] if nothing is registered
    /// - [`ConsumerError::Cancelled`] if `cancel` was already called
    /// - [`ConsumerError::AlreadyRunning`] on a concurrent call
    /// - [`ConsumerError::Connection`] / [`ConsumerError::Receiver`] at startup
    /// - the first runner failure, after the other runners have stopped
    pub async fn run_filtered(
        &self,
        bus: &dyn MessageBus,
        filter: Option<&HashSet<SubscriptionKey>>,
    ) -> Result<(), ConsumerError> {
        if self.descriptors.is_empty() {
            return Err(ConsumerError::NoSubscriptions);
        }
        if self.is_cancelled() {
            return Err(ConsumerError::Cancelled);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ConsumerError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let selected: Vec<&SubscriptionDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| filter.is_none_or(|keys| keys.contains(d.key())))
            .collect();
        if selected.is_empty() {
            tracing::warn!("Subscription filter matched no registered subscription");
            return Ok(());
        }

        tracing::info!(subscriptions = selected.len(), "Starting consumer");
        let connection = bus.connect().await.map_err(ConsumerError::Connection)?;
        let connection_guard = CloseGuard::connection(Arc::clone(&connection));

        let result = self.run_connected(connection.as_ref(), &selected).await;

        connection_guard.close().await;
        tracing::info!("Consumer stopped");
        result
    }

    async fn run_connected(
        &self,
        connection: &dyn BusConnection,
        selected: &[&SubscriptionDescriptor],
    ) -> Result<(), ConsumerError> {
        let mut receivers: Vec<Arc<dyn Receiver>> = Vec::with_capacity(selected.len());
        let mut opened: Vec<CloseGuard> = Vec::with_capacity(selected.len());
        for descriptor in selected {
            match connection
                .receiver(descriptor.topic(), descriptor.subscription())
                .await
            {
                Ok(receiver) => {
                    opened.push(CloseGuard::receiver(Arc::clone(&receiver)));
                    receivers.push(receiver);
                }
                Err(error) => {
                    for guard in opened {
                        guard.close().await;
                    }
                    return Err(ConsumerError::Receiver(error));
                }
            }
        }

        let runners: Vec<SubscriptionRunner> = selected
            .iter()
            .zip(receivers)
            .map(|(descriptor, receiver)| {
                SubscriptionRunner::new(
                    descriptor,
                    receiver,
                    descriptor.settings(&self.config),
                    self.config.receive_retry.clone(),
                    self.shutdown.clone(),
                )
            })
            .collect();
        // Each runner now closes its own receiver.
        opened.into_iter().for_each(CloseGuard::disarm);

        let runs = runners.into_iter().map(|runner| async move {
            let result = runner.run().await;
            if result.is_err() {
                // One fatal runner stops the rest after their current batch.
                self.cancel();
            }
            result
        });

        join_all(runs)
            .await
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for ConsumerApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerApp")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("descriptors", &self.descriptors)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
