//! # Pubsub Kit Runtime
//!
//! The subscription consumer engine.
//!
//! Handlers are registered on a [`ConsumerApp`]; [`ConsumerApp::run`] then
//! connects to the bus and drives one receive loop per subscription until
//! cancelled.
//!
//! ## Core Components
//!
//! - **Registration**: `consume`, `consume_with(..).bind(..)`, `register` and
//!   the [`consume!`] macro derive a [`SubscriptionDescriptor`] per handler
//! - **Settlement Adapter**: parses, converts, calls the handler and settles
//!   the message exactly once
//! - **Lock Renewer**: keeps message locks alive while handlers run
//! - **Subscription Runner**: batch receive, concurrent dispatch, fan-in
//! - **Engine**: one runner per subscription, cooperative shutdown, and
//!   teardown of the connection and receivers on every exit path
//!
//! ## Example
//!
//! ```no_run
//! use pubsub_kit_core::{state_change_event, MessageBus, Outcome};
//! use pubsub_kit_runtime::{consume, ConsumerApp, ConsumerConfig};
//!
//! state_change_event! {
//!     pub struct TaskCreated {
//!         entity_type: "task",
//!         new_state: "created",
//!     }
//! }
//!
//! async fn on_task_created(event: TaskCreated) -> Outcome {
//!     println!("task {} created", event.entity_id);
//!     Outcome::Success
//! }
//!
//! # async fn example(bus: &dyn MessageBus) -> Result<(), Box<dyn std::error::Error>> {
//! let mut app = ConsumerApp::new(ConsumerConfig::new("task-service"));
//! app.register_event_type::<TaskCreated>()?;
//! consume!(app, on_task_created)?;
//!
//! app.run(bus).await?;
//! # Ok(())
//! # }
//! ```

/// Consumer engine, registration API and shutdown handle
pub mod app;

/// Engine-wide configuration
pub mod config;

/// Automatic message lock renewal
pub mod lock_renewal;

/// Prometheus metrics for observability
pub mod metrics;

/// Event publishing
pub mod publisher;

/// Retry logic with exponential backoff
pub mod retry;

/// Per-subscription receive loop
pub mod runner;

/// Settlement adapter wrapping handlers
pub mod settlement;

/// Cancellation and bus teardown
pub mod shutdown;

/// Subscription descriptors and registration options
pub mod subscription;

/// Error types for the consumer runtime
pub mod error {
    use pubsub_kit_core::error::{BusError, ConversionError, HandlerError, RegistrationError};
    use thiserror::Error;

    /// Errors returned by [`ConsumerApp::run`](crate::ConsumerApp::run).
    #[derive(Error, Debug)]
    pub enum ConsumerError {
        /// `run` was called with nothing registered.
        #[error("No subscriptions registered")]
        NoSubscriptions,

        /// `run` is already in progress on this app.
        #[error("Consumer is already running")]
        AlreadyRunning,

        /// `cancel` was called before `run`.
        #[error("Consumer was cancelled")]
        Cancelled,

        /// The bus connection could not be acquired.
        #[error("Failed to connect to the message bus: {0}")]
        Connection(#[source] BusError),

        /// A receiver could not be opened.
        #[error("Failed to open receiver: {0}")]
        Receiver(#[source] BusError),

        /// Batch receive kept failing after all retries.
        #[error("Receive failed for '{topic}|{subscription}' after {attempts} attempts: {source}")]
        ReceiveExhausted {
            /// Topic name
            topic: String,
            /// Subscription name
            subscription: String,
            /// Number of failed attempts
            attempts: usize,
            /// The last error
            #[source]
            source: BusError,
        },
    }

    /// Errors raised while loading configuration.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ConfigError {
        /// A required variable is not set.
        #[error("Missing required configuration '{0}'")]
        Missing(&'static str),

        /// A variable does not parse or is out of range.
        #[error("Invalid configuration '{key}': {reason}")]
        Invalid {
            /// Variable name
            key: &'static str,
            /// Why it was rejected
            reason: String,
        },
    }

    /// Why a message was abandoned instead of handled.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DispatchError {
        /// The body is not a JSON object.
        #[error("Failed to parse message body: {0}")]
        Parse(#[source] ConversionError),

        /// The payload does not fit the handler's parameter type.
        #[error("Failed to convert payload: {0}")]
        Conversion(#[source] ConversionError),

        /// The handler returned an error.
        #[error("Handler failed: {0}")]
        Handler(#[source] HandlerError),

        /// The handler or converter panicked.
        #[error("Handler panicked: {0}")]
        Panicked(String),
    }

    /// Errors returned by the [`Publisher`](crate::publisher::Publisher).
    #[derive(Error, Debug)]
    pub enum PublishError {
        /// No topic can be derived from the event type name.
        #[error(transparent)]
        Topic(#[from] RegistrationError),

        /// The bus rejected the message.
        #[error(transparent)]
        Bus(#[from] BusError),
    }
}

pub use app::{ConsumeBinder, ConsumerApp};
pub use config::ConsumerConfig;
pub use error::{ConfigError, ConsumerError, DispatchError, PublishError};
pub use publisher::Publisher;
pub use retry::RetryPolicy;
pub use shutdown::ShutdownHandle;
pub use subscription::{ConsumeOptions, SubscriptionDescriptor, SubscriptionKey, SubscriptionSpec};
