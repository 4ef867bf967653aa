//! Event type traits.
//!
//! Every message payload that handlers receive in structured form is a *state
//! change event*: it names the kind of entity that changed, the entity's id and
//! the entity's new state, plus any type-specific fields.
//!
//! Concrete event types implement [`EventType`], which adds the type name used
//! for topic derivation and the factory that builds the event from a raw JSON
//! payload. The [`state_change_event!`](crate::state_change_event) macro
//! implements both traits for a plain struct.
//!
//! # Example
//!
//! ```
//! use pubsub_kit_core::event::{EventType, StateChangeEvent};
//! use pubsub_kit_core::error::ConversionError;
//! use pubsub_kit_core::payload::RawPayload;
//!
//! #[derive(Debug)]
//! struct TaskCreated {
//!     entity_id: String,
//! }
//!
//! impl StateChangeEvent for TaskCreated {
//!     fn entity_type(&self) -> &str { "task" }
//!     fn entity_id(&self) -> &str { &self.entity_id }
//!     fn new_state(&self) -> &str { "created" }
//! }
//!
//! impl EventType for TaskCreated {
//!     const TYPE_NAME: &'static str = "TaskCreated";
//!
//!     fn from_raw(raw: &RawPayload) -> Result<Self, ConversionError> {
//!         Ok(Self { entity_id: raw.field("entity_id")? })
//!     }
//! }
//! ```

use crate::error::ConversionError;
use crate::payload::RawPayload;
use std::any::Any;
use std::fmt;

/// Conversion of owned and borrowed values into [`Any`] for downcasting.
///
/// Implemented for every sized `Send + 'static` type; it lets a boxed
/// [`StateChangeEvent`] be recovered as its concrete type.
pub trait AsAny: Any + Send {
    /// Convert a boxed value into a boxed [`Any`].
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// Borrow the value as [`Any`].
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send> AsAny for T {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Object-safe view of a state change event.
pub trait StateChangeEvent: AsAny + fmt::Debug + Sync {
    /// The kind of entity that changed (e.g. `"task"`).
    fn entity_type(&self) -> &str;

    /// The id of the entity that changed.
    fn entity_id(&self) -> &str;

    /// The state the entity moved to (e.g. `"created"`).
    fn new_state(&self) -> &str;
}

/// A concrete event type that can be registered for a topic.
pub trait EventType: StateChangeEvent + Sized {
    /// PascalCase type name used to derive the topic (e.g. `"TaskCreated"`).
    ///
    /// A trailing `StateChangeEvent` or `Event` suffix is ignored.
    const TYPE_NAME: &'static str;

    /// Build the event from a raw JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] if required fields are missing or malformed.
    fn from_raw(raw: &RawPayload) -> Result<Self, ConversionError>;

    /// Render the event as a raw JSON payload for publishing.
    ///
    /// The default emits `entity_type`, `entity_id` and `new_state`; types with
    /// extra fields override it.
    fn to_raw(&self) -> RawPayload {
        RawPayload::from_event(self)
    }
}
