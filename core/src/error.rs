//! Error types shared by every layer of the consumer framework.
//!
//! Errors fall into two tiers:
//!
//! - **Registration-time** ([`RegistrationError`]): programmer errors surfaced
//!   while handlers are being bound. They abort startup and are never retried.
//! - **Message-processing-time** ([`ConversionError`], [`HandlerError`]):
//!   recovered per message by abandoning it so the bus redelivers it.
//!
//! [`BusError`] covers failures reported by the message-bus collaborator.

use thiserror::Error;

/// Errors raised while registering event types or handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Handler name does not follow the `on_<entity>_<event>` convention.
    #[error(
        "Handler '{handler}' does not follow the naming convention on_<entity>_<event> \
         (pass an explicit topic to bind it)"
    )]
    NamingConvention {
        /// The offending handler name
        handler: String,
    },

    /// An event type name cannot be turned into a topic name.
    #[error("Event type name '{type_name}' must be PascalCase (e.g. TaskCreated)")]
    InvalidEventTypeName {
        /// The offending type name
        type_name: String,
    },

    /// No event type is registered for the topic a structured handler binds to.
    #[error("No event type registered for topic '{topic}' (handler '{handler}')")]
    UnknownEventType {
        /// The topic that failed to resolve
        topic: String,
        /// The handler being registered
        handler: String,
    },

    /// A handler declares a payload type that was never registered.
    #[error("Unsupported payload type '{type_name}' for handler '{handler}'")]
    UnsupportedPayloadType {
        /// The declared payload type
        type_name: &'static str,
        /// The handler being registered
        handler: String,
    },

    /// The (topic, subscription) pair already has a handler.
    #[error("A handler is already registered for topic '{topic}' and subscription '{subscription}'")]
    DuplicateSubscription {
        /// Topic name
        topic: String,
        /// Subscription name
        subscription: String,
    },

    /// The topic or the event type is already bound in the registry.
    #[error("Event type '{type_name}' conflicts with an existing registration for topic '{topic}'")]
    DuplicateEventType {
        /// Topic name
        topic: String,
        /// The type being registered
        type_name: &'static str,
    },

    /// A topic or subscription name is empty.
    #[error("{0} must not be empty")]
    EmptyName(&'static str),
}

/// Errors raised while turning a received message into a handler payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// The message body is not valid JSON.
    #[error("Message body is not valid JSON: {0}")]
    InvalidJson(String),

    /// The message body is JSON but not an object.
    #[error("Message body must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// A required field is absent.
    #[error("Missing field '{0}'")]
    MissingField(String),

    /// A field is present but has the wrong shape.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// The registered constructor produced a different type than the handler expects.
    #[error("Converted event is not a '{expected}'")]
    TypeMismatch {
        /// The type the handler declared
        expected: &'static str,
    },
}

/// A failure reported by a handler (an `Err` return or a panic).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error from any message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors reported by the message-bus collaborator.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to connect to the bus (fatal for `run`).
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to open a receiver for a subscription.
    #[error("Receiver failed for topic '{topic}', subscription '{subscription}': {reason}")]
    ReceiverFailed {
        /// Topic name
        topic: String,
        /// Subscription name
        subscription: String,
        /// The reason for failure
        reason: String,
    },

    /// A batch receive call failed.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A complete/abandon/dead-letter call failed.
    #[error("Settlement '{action}' failed for message '{message_id}': {reason}")]
    SettlementFailed {
        /// Message id
        message_id: String,
        /// The settlement action attempted
        action: &'static str,
        /// The reason for failure
        reason: String,
    },

    /// A lock renewal call failed.
    #[error("Lock renewal failed for message '{message_id}': {reason}")]
    LockRenewalFailed {
        /// Message id
        message_id: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to publish a message to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}
