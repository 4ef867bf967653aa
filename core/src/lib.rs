//! # Pubsub Kit Core
//!
//! Core traits and types for convention-driven topic/subscription consumers.
//!
//! This crate holds everything that does not need an async runtime: the
//! naming conventions that tie handlers, topics and event types together,
//! the event type registry, payload conversion, handler outcomes and the
//! message bus traits that transports implement.
//!
//! ## Core Concepts
//!
//! - **Event type**: a struct implementing [`EventType`], bound to one topic
//! - **Registry**: [`EventTypeRegistry`], topic name to event type
//! - **Payload**: what a handler receives ([`RawPayload`], [`AnyEvent`] or a concrete event)
//! - **Outcome**: what a handler returns ([`Outcome`]), mapped to a [`Settlement`]
//! - **Bus**: [`MessageBus`], [`BusConnection`] and [`Receiver`]
//!
//! ## Example
//!
//! ```
//! use pubsub_kit_core::{state_change_event, EventTypeRegistry};
//!
//! state_change_event! {
//!     pub struct TaskCreated {
//!         entity_type: "task",
//!         new_state: "created",
//!     }
//! }
//!
//! let mut registry = EventTypeRegistry::new();
//! assert_eq!(registry.register::<TaskCreated>().unwrap(), "task-created");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

#[doc(hidden)]
pub use serde_json;

/// Message bus traits
pub mod bus;

/// Error types
pub mod error;

/// Event traits
pub mod event;

/// `state_change_event!` macro
pub mod event_macros;

/// Naming-convention helpers
pub mod naming;

/// Handler outcomes and settlements
pub mod outcome;

/// Raw payloads and payload conversion
pub mod payload;

/// Event type registry
pub mod registry;

pub use bus::{BusConnection, BusFuture, MessageBus, ReceivedMessage, Receiver};
pub use error::{BusError, ConversionError, HandlerError, RegistrationError};
pub use event::{EventType, StateChangeEvent};
pub use outcome::{IntoOutcome, Outcome, Settlement, DROPPED_BY_SUBSCRIBER};
pub use payload::{converter_for, AnyEvent, Payload, PayloadConverter, RawPayload};
pub use registry::EventTypeRegistry;
