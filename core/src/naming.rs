//! Naming-convention helpers.
//!
//! Topic names, event type names and handler names are derived from each other
//! by deterministic string transforms:
//!
//! ```text
//! handler name        topic name        event type name
//! on_task_created ⇄  task-created  ⇄  TaskCreated (or TaskCreatedEvent,
//!                                                   TaskCreatedStateChangeEvent)
//! ```
//!
//! The derivation is consistent in both directions: for every valid type name
//! `T`, `topic_from_handler_name(handler_name_for_type(T)) == topic_from_type_name(T)`.
//!
//! # Example
//!
//! ```
//! use pubsub_kit_core::naming;
//!
//! assert_eq!(naming::topic_from_handler_name("on_task_created").unwrap(), "task-created");
//! assert_eq!(naming::topic_from_type_name("TaskCreatedEvent").unwrap(), "task-created");
//! assert_eq!(naming::type_name_for_topic("task-created"), "TaskCreated");
//! assert_eq!(naming::handler_name_for_topic("task-created"), "on_task_created");
//! ```

use crate::error::RegistrationError;

/// Suffixes ignored when deriving a topic from an event type name, longest first.
const TYPE_NAME_SUFFIXES: [&str; 2] = ["StateChangeEvent", "Event"];

/// Replace underscores with dashes.
#[must_use]
pub fn snake_to_kebab(s: &str) -> String {
    s.replace('_', "-")
}

/// Insert a dash before every uppercase letter except the first, then lowercase.
///
/// `TaskCreated` becomes `task-created`.
#[must_use]
pub fn pascal_to_kebab(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && c.is_ascii_uppercase() {
            out.push('-');
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

/// Uppercase the first letter of every dash-separated segment and join them.
///
/// `task-created` becomes `TaskCreated`.
#[must_use]
pub fn kebab_to_pascal(s: &str) -> String {
    s.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect()
}

/// Derive a topic name from a handler name of the form `on_<entity>_<event>`.
///
/// A leading module path (`handlers::on_task_created`) is ignored, and the
/// kebab spelling `on-task-created` is accepted as well.
///
/// # Errors
///
/// Returns [`RegistrationError::NamingConvention`] if the name lacks the `on_`
/// prefix or contains anything other than lowercase letters, digits and
/// separators after it.
pub fn topic_from_handler_name(handler_name: &str) -> Result<String, RegistrationError> {
    let short = handler_name
        .rsplit("::")
        .next()
        .unwrap_or(handler_name)
        .trim();
    let violation = || RegistrationError::NamingConvention {
        handler: handler_name.to_string(),
    };

    let rest = short
        .strip_prefix("on_")
        .or_else(|| short.strip_prefix("on-"))
        .ok_or_else(violation)?;

    let topic = snake_to_kebab(rest);
    if is_valid_topic(&topic) {
        Ok(topic)
    } else {
        Err(violation())
    }
}

/// Derive a topic name from an event type name.
///
/// A trailing `StateChangeEvent` or `Event` suffix is dropped before the
/// PascalCase name is converted, so `TaskCreated`, `TaskCreatedEvent` and
/// `TaskCreatedStateChangeEvent` all map to `task-created`.
///
/// # Errors
///
/// Returns [`RegistrationError::InvalidEventTypeName`] if the name is not an
/// ASCII PascalCase identifier.
pub fn topic_from_type_name(type_name: &str) -> Result<String, RegistrationError> {
    let base = TYPE_NAME_SUFFIXES
        .iter()
        .find_map(|suffix| type_name.strip_suffix(suffix).filter(|b| !b.is_empty()))
        .unwrap_or(type_name);

    let pascal = base.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && base.chars().all(|c| c.is_ascii_alphanumeric());
    if !pascal {
        return Err(RegistrationError::InvalidEventTypeName {
            type_name: type_name.to_string(),
        });
    }

    Ok(pascal_to_kebab(base))
}

/// The PascalCase event type name for a topic (without suffix).
#[must_use]
pub fn type_name_for_topic(topic: &str) -> String {
    kebab_to_pascal(topic)
}

/// The conventional handler function name for a topic.
#[must_use]
pub fn handler_name_for_topic(topic: &str) -> String {
    format!("on_{}", topic.replace('-', "_"))
}

/// The conventional handler function name for an event type name.
///
/// # Errors
///
/// Returns [`RegistrationError::InvalidEventTypeName`] if the type name is invalid.
pub fn handler_name_for_type(type_name: &str) -> Result<String, RegistrationError> {
    topic_from_type_name(type_name).map(|topic| handler_name_for_topic(&topic))
}

fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.split('-').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn handler_names_map_to_topics() {
        assert_eq!(topic_from_handler_name("on_task_created").unwrap(), "task-created");
        assert_eq!(topic_from_handler_name("on_user_created").unwrap(), "user-created");
        assert_eq!(topic_from_handler_name("on_sample_event1").unwrap(), "sample-event1");
        assert_eq!(topic_from_handler_name("on-task-updated").unwrap(), "task-updated");
        assert_eq!(
            topic_from_handler_name("handlers::tasks::on_task_created").unwrap(),
            "task-created"
        );
    }

    #[test]
    fn handler_names_violating_convention_are_rejected() {
        for name in ["task_created", "handle_task", "on_", "on__task", "on_Task_created", "on_task_"] {
            assert_eq!(
                topic_from_handler_name(name),
                Err(RegistrationError::NamingConvention {
                    handler: name.to_string()
                }),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn type_names_map_to_topics() {
        assert_eq!(topic_from_type_name("TaskCreated").unwrap(), "task-created");
        assert_eq!(topic_from_type_name("TaskCreatedEvent").unwrap(), "task-created");
        assert_eq!(
            topic_from_type_name("TaskCreatedStateChangeEvent").unwrap(),
            "task-created"
        );
        assert_eq!(topic_from_type_name("Event").unwrap(), "event");
        assert!(topic_from_type_name("taskCreated").is_err());
        assert!(topic_from_type_name("Task_Created").is_err());
        assert!(topic_from_type_name("").is_err());
    }

    #[test]
    fn topics_map_back_to_type_and_handler_names() {
        assert_eq!(type_name_for_topic("task-created"), "TaskCreated");
        assert_eq!(type_name_for_topic("user-created"), "UserCreated");
        assert_eq!(handler_name_for_topic("task-created"), "on_task_created");
        assert_eq!(handler_name_for_type("UserCreatedEvent").unwrap(), "on_user_created");
    }

    proptest! {
        #[test]
        fn type_name_round_trips_through_handler_name(
            type_name in "[A-Z][a-z0-9]{0,6}([A-Z][a-z0-9]{0,6}){0,3}"
        ) {
            let topic = topic_from_type_name(&type_name).unwrap();
            let handler = handler_name_for_type(&type_name).unwrap();
            prop_assert_eq!(topic_from_handler_name(&handler).unwrap(), topic);
        }

        #[test]
        fn topic_round_trips_through_type_name(
            topic in "[a-z][a-z0-9]{0,6}(-[a-z][a-z0-9]{0,6}){0,3}"
        ) {
            prop_assume!(!topic.ends_with("-event") && topic != "event");
            let type_name = type_name_for_topic(&topic);
            prop_assert_eq!(topic_from_type_name(&type_name).unwrap(), topic.clone());
            prop_assert_eq!(topic_from_handler_name(&handler_name_for_topic(&topic)).unwrap(), topic);
        }
    }
}
