//! Event type registry.
//!
//! Maps topic names to the event type whose messages flow on that topic. Each
//! topic has at most one event type and each event type at most one topic.
//! The topic is derived from the type name unless registered explicitly.

use crate::error::{ConversionError, RegistrationError};
use crate::event::EventType;
use crate::naming;
use crate::payload::{AnyEvent, RawPayload};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builds a boxed event from a raw payload.
pub type EventConstructor =
    Arc<dyn Fn(&RawPayload) -> Result<AnyEvent, ConversionError> + Send + Sync>;

/// A registered event type.
#[derive(Clone)]
pub struct RegisteredEventType {
    topic: String,
    type_name: &'static str,
    type_id: TypeId,
    construct: EventConstructor,
}

impl RegisteredEventType {
    fn of<E: EventType>(topic: String) -> Self {
        Self {
            topic,
            type_name: E::TYPE_NAME,
            type_id: TypeId::of::<E>(),
            construct: Arc::new(|raw| E::from_raw(raw).map(AnyEvent::new)),
        }
    }

    /// The topic the type is bound to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The declared type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The type's id.
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The factory building this type from a raw payload.
    #[must_use]
    pub fn constructor(&self) -> EventConstructor {
        Arc::clone(&self.construct)
    }

    /// Build an event of this type from a raw payload.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError`] if the payload does not fit the type.
    pub fn construct(&self, raw: &RawPayload) -> Result<AnyEvent, ConversionError> {
        (self.construct)(raw)
    }
}

impl fmt::Debug for RegisteredEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredEventType")
            .field("topic", &self.topic)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Topic name to event type mapping.
#[derive(Debug, Clone, Default)]
pub struct EventTypeRegistry {
    by_topic: HashMap<String, RegisteredEventType>,
    by_type: HashMap<TypeId, String>,
}

impl EventTypeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event type under the topic derived from its type name.
    ///
    /// Returns the topic the type was bound to.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::InvalidEventTypeName`] if the name is not PascalCase.
    /// - [`RegistrationError::DuplicateEventType`] if the topic or type is taken.
    pub fn register<E: EventType>(&mut self) -> Result<String, RegistrationError> {
        let topic = naming::topic_from_type_name(E::TYPE_NAME)?;
        self.register_for_topic::<E>(topic)
    }

    /// Register an event type under an explicit topic.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::EmptyName`] if the topic is empty.
    /// - [`RegistrationError::DuplicateEventType`] if the topic or type is taken.
    pub fn register_for_topic<E: EventType>(
        &mut self,
        topic: impl Into<String>,
    ) -> Result<String, RegistrationError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(RegistrationError::EmptyName("topic"));
        }

        let type_id = TypeId::of::<E>();
        if self.by_topic.contains_key(&topic) || self.by_type.contains_key(&type_id) {
            return Err(RegistrationError::DuplicateEventType {
                topic,
                type_name: E::TYPE_NAME,
            });
        }

        self.by_type.insert(type_id, topic.clone());
        self.by_topic
            .insert(topic.clone(), RegisteredEventType::of::<E>(topic.clone()));
        Ok(topic)
    }

    /// Look up the event type registered for a topic.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> Option<&RegisteredEventType> {
        self.by_topic.get(topic)
    }

    /// Look up a registered event type by type id.
    #[must_use]
    pub fn resolve_type(&self, type_id: TypeId) -> Option<&RegisteredEventType> {
        self.by_type
            .get(&type_id)
            .and_then(|topic| self.by_topic.get(topic))
    }

    /// The topic an event type is registered under.
    #[must_use]
    pub fn topic_of<E: EventType>(&self) -> Option<&str> {
        self.by_type.get(&TypeId::of::<E>()).map(String::as_str)
    }

    /// Whether a topic has a registered event type.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.by_topic.contains_key(topic)
    }

    /// All registered topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.by_topic.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    /// Number of registered event types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state_change_event;

    state_change_event! {
        struct TaskCreated {
            entity_type: "task",
            new_state: "created",
        }
    }

    state_change_event! {
        struct UserCreatedEvent {
            entity_type: "user",
            new_state: "created",
        }
    }

    state_change_event! {
        struct ArchivedTask {
            entity_type: "task",
            new_state: "archived",
        }
    }

    #[test]
    fn register_derives_topic_from_type_name() {
        let mut registry = EventTypeRegistry::new();
        assert_eq!(registry.register::<TaskCreated>().unwrap(), "task-created");
        assert_eq!(registry.register::<UserCreatedEvent>().unwrap(), "user-created");

        assert_eq!(registry.resolve("task-created").unwrap().type_name(), "TaskCreated");
        assert_eq!(registry.topic_of::<UserCreatedEvent>(), Some("user-created"));
        assert_eq!(registry.topics(), vec!["task-created", "user-created"]);
        assert!(registry.resolve("task-updated").is_none());
    }

    #[test]
    fn explicit_topic_overrides_convention() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register_for_topic::<ArchivedTask>("legacy.task.archived")
            .unwrap();
        assert!(registry.contains("legacy.task.archived"));
        assert!(!registry.contains("archived-task"));
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut registry = EventTypeRegistry::new();
        registry.register::<TaskCreated>().unwrap();

        assert!(matches!(
            registry.register::<TaskCreated>(),
            Err(RegistrationError::DuplicateEventType { .. })
        ));
        assert!(matches!(
            registry.register_for_topic::<ArchivedTask>("task-created"),
            Err(RegistrationError::DuplicateEventType { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_topic_is_rejected() {
        let mut registry = EventTypeRegistry::new();
        assert_eq!(
            registry.register_for_topic::<TaskCreated>(""),
            Err(RegistrationError::EmptyName("topic"))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn registered_constructor_builds_events() {
        let mut registry = EventTypeRegistry::new();
        registry.register::<TaskCreated>().unwrap();
        let entry = registry.resolve_type(TypeId::of::<TaskCreated>()).unwrap();

        let raw = RawPayload::parse(br#"{"entity_id":"42"}"#).unwrap();
        let event = entry.construct(&raw).unwrap();
        assert_eq!(event.entity_id(), "42");
        assert_eq!(event.new_state(), "created");
    }
}
