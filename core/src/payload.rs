//! Raw payloads, payload types and the payload converter.
//!
//! A handler's parameter type decides how a received message body is turned
//! into the value the handler is called with:
//!
//! | Parameter type      | Conversion                                              |
//! |---------------------|---------------------------------------------------------|
//! | [`RawPayload`]      | none (the parsed JSON object is passed through)         |
//! | [`AnyEvent`]        | the event type registered for the subscription's topic  |
//! | `T: EventType`      | `T::from_raw`, provided `T` is registered               |
//!
//! The converter is built once at registration time by [`converter_for`], so
//! unknown or unsupported types fail before any message is received.

use crate::error::{ConversionError, RegistrationError};
use crate::event::{EventType, StateChangeEvent};
use crate::registry::EventTypeRegistry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::TypeId;
use std::ops::Deref;
use std::sync::Arc;

/// A message body parsed as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(Map<String, Value>);

impl RawPayload {
    /// Create an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Parse a message body.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidJson`] if the body is not JSON and
    /// [`ConversionError::NotAnObject`] if it is JSON but not an object.
    pub fn parse(body: &[u8]) -> Result<Self, ConversionError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ConversionError::InvalidJson(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Err(ConversionError::NotAnObject("null")),
            Value::Bool(_) => Err(ConversionError::NotAnObject("a boolean")),
            Value::Number(_) => Err(ConversionError::NotAnObject("a number")),
            Value::String(_) => Err(ConversionError::NotAnObject("a string")),
            Value::Array(_) => Err(ConversionError::NotAnObject("an array")),
        }
    }

    /// Build the base payload (`entity_type`, `entity_id`, `new_state`) of an event.
    #[must_use]
    pub fn from_event<E: StateChangeEvent + ?Sized>(event: &E) -> Self {
        let mut raw = Self::new();
        raw.insert("entity_type", event.entity_type());
        raw.insert("entity_id", event.entity_id());
        raw.insert("new_state", event.new_state());
        raw
    }

    /// Read and deserialize a required field.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::MissingField`] if the field is absent and
    /// [`ConversionError::InvalidField`] if it has the wrong shape.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConversionError> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| ConversionError::MissingField(name.to_string()))?;
        T::deserialize(value).map_err(|e| ConversionError::InvalidField {
            field: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Read and deserialize an optional field; `null` counts as absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidField`] if the field has the wrong shape.
    pub fn optional_field<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, ConversionError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.field(name).map(Some),
        }
    }

    /// Read a field the way a derived struct would: an absent field is
    /// deserialized from `null`, so `Option` fields may be omitted.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::MissingField`] if the field is absent and
    /// not optional, and [`ConversionError::InvalidField`] on a shape mismatch.
    pub fn struct_field<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConversionError> {
        if self.0.contains_key(name) {
            self.field(name)
        } else {
            T::deserialize(Value::Null).map_err(|_| ConversionError::MissingField(name.to_string()))
        }
    }

    /// Deserialize the whole payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidField`] (with field `"$"`) on mismatch.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ConversionError> {
        T::deserialize(Value::Object(self.0.clone())).map_err(|e| ConversionError::InvalidField {
            field: "$".to_string(),
            reason: e.to_string(),
        })
    }

    /// Set a field, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Serialize the payload as a JSON message body.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        Value::Object(self.0.clone()).to_string().into_bytes()
    }

    /// Borrow the underlying JSON object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the underlying JSON object.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl Deref for RawPayload {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Map<String, Value>> for RawPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A structured event whose concrete type is decided by the topic.
///
/// Handlers that take `AnyEvent` receive whatever event type is registered
/// for the topic they consume, viewed through [`StateChangeEvent`].
#[derive(Debug)]
pub struct AnyEvent(Box<dyn StateChangeEvent>);

impl AnyEvent {
    /// Wrap a concrete event.
    #[must_use]
    pub fn new<E: StateChangeEvent>(event: E) -> Self {
        Self(Box::new(event))
    }

    /// Borrow the event as its concrete type.
    #[must_use]
    pub fn downcast_ref<E: StateChangeEvent>(&self) -> Option<&E> {
        self.0.as_ref().as_any().downcast_ref::<E>()
    }

    /// Recover the concrete event, or `None` if it is another type.
    #[must_use]
    pub fn downcast<E: StateChangeEvent>(self) -> Option<E> {
        self.0.into_any().downcast::<E>().ok().map(|event| *event)
    }
}

impl Deref for AnyEvent {
    type Target = dyn StateChangeEvent;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

/// How a payload type wants to be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Pass the parsed JSON object through unchanged.
    Raw,

    /// Use the event type registered for the subscription's topic.
    Topic,

    /// Use a specific, registered event type.
    Event {
        /// Type id of the event type
        type_id: TypeId,
        /// Its declared type name
        type_name: &'static str,
    },
}

/// Intermediate value handed to [`Payload::from_converted`].
#[derive(Debug)]
pub enum Converted {
    /// The parsed JSON object
    Raw(RawPayload),
    /// An event built by a registered constructor
    Event(AnyEvent),
}

/// A type a handler can declare as its single parameter.
pub trait Payload: Send + Sized + 'static {
    /// How messages are converted into this type.
    fn kind() -> PayloadKind;

    /// Finish the conversion.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] if the converted value does not fit this type.
    fn from_converted(converted: Converted) -> Result<Self, ConversionError>;
}

impl Payload for RawPayload {
    fn kind() -> PayloadKind {
        PayloadKind::Raw
    }

    fn from_converted(converted: Converted) -> Result<Self, ConversionError> {
        match converted {
            Converted::Raw(raw) => Ok(raw),
            Converted::Event(event) => Ok(Self::from_event(&*event)),
        }
    }
}

impl Payload for AnyEvent {
    fn kind() -> PayloadKind {
        PayloadKind::Topic
    }

    fn from_converted(converted: Converted) -> Result<Self, ConversionError> {
        match converted {
            Converted::Event(event) => Ok(event),
            Converted::Raw(_) => Err(ConversionError::TypeMismatch {
                expected: "AnyEvent",
            }),
        }
    }
}

impl<T: EventType> Payload for T {
    fn kind() -> PayloadKind {
        PayloadKind::Event {
            type_id: TypeId::of::<T>(),
            type_name: T::TYPE_NAME,
        }
    }

    fn from_converted(converted: Converted) -> Result<Self, ConversionError> {
        match converted {
            Converted::Event(event) => event.downcast::<T>().ok_or(ConversionError::TypeMismatch {
                expected: T::TYPE_NAME,
            }),
            Converted::Raw(raw) => T::from_raw(&raw),
        }
    }
}

/// Converts a parsed message body into a handler's payload type.
pub type PayloadConverter<P> =
    Arc<dyn Fn(RawPayload) -> Result<P, ConversionError> + Send + Sync>;

/// Build the converter for a handler declaring payload type `P` on `topic`.
///
/// # Errors
///
/// - [`RegistrationError::UnknownEventType`] if `P` is [`AnyEvent`] and no
///   event type is registered for `topic`.
/// - [`RegistrationError::UnsupportedPayloadType`] if `P` is an event type
///   that was never registered.
pub fn converter_for<P: Payload>(
    registry: &EventTypeRegistry,
    topic: &str,
    handler: &str,
) -> Result<PayloadConverter<P>, RegistrationError> {
    let entry = match P::kind() {
        PayloadKind::Raw => {
            return Ok(Arc::new(|raw| P::from_converted(Converted::Raw(raw))));
        }
        PayloadKind::Topic => {
            registry
                .resolve(topic)
                .ok_or_else(|| RegistrationError::UnknownEventType {
                    topic: topic.to_string(),
                    handler: handler.to_string(),
                })?
        }
        PayloadKind::Event { type_id, type_name } => {
            registry
                .resolve_type(type_id)
                .ok_or_else(|| RegistrationError::UnsupportedPayloadType {
                    type_name,
                    handler: handler.to_string(),
                })?
        }
    };

    let construct = entry.constructor();
    Ok(Arc::new(move |raw| {
        let event = construct(&raw)?;
        P::from_converted(Converted::Event(event))
    }))
}
