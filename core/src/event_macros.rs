//! Declarative macro for defining state change events.

/// Define a state change event struct and implement
/// [`StateChangeEvent`](crate::event::StateChangeEvent) and
/// [`EventType`](crate::event::EventType) for it.
///
/// The struct gets an `entity_id: String` field plus the listed fields.
/// `entity_type` and `new_state` are fixed per type. The type name used for
/// topic derivation is the struct's identifier.
///
/// Extra fields must implement `Serialize`, `DeserializeOwned`, `Debug`,
/// `Clone` and `PartialEq`. `Option` fields may be absent from the payload.
///
/// # Example
///
/// ```
/// use pubsub_kit_core::state_change_event;
/// use pubsub_kit_core::event::{EventType, StateChangeEvent};
/// use pubsub_kit_core::payload::RawPayload;
///
/// state_change_event! {
///     /// A task was assigned to someone.
///     pub struct TaskAssigned {
///         entity_type: "task",
///         new_state: "assigned",
///         pub assignee: String,
///     }
/// }
///
/// let raw = RawPayload::parse(br#"{"entity_id":"1","assignee":"sam"}"#).unwrap();
/// let event = TaskAssigned::from_raw(&raw).unwrap();
/// assert_eq!(event.assignee, "sam");
/// assert_eq!(event.new_state(), "assigned");
/// assert_eq!(TaskAssigned::TYPE_NAME, "TaskAssigned");
/// ```
#[macro_export]
macro_rules! state_change_event {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            entity_type: $entity_type:literal,
            new_state: $new_state:literal,
            $( $(#[$field_meta:meta])* $field_vis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            /// Id of the entity that changed
            pub entity_id: ::std::string::String,
            $( $(#[$field_meta])* $field_vis $field: $ty, )*
        }

        impl $crate::event::StateChangeEvent for $name {
            fn entity_type(&self) -> &str {
                $entity_type
            }

            fn entity_id(&self) -> &str {
                &self.entity_id
            }

            fn new_state(&self) -> &str {
                $new_state
            }
        }

        impl $crate::event::EventType for $name {
            const TYPE_NAME: &'static str = ::core::stringify!($name);

            fn from_raw(
                raw: &$crate::payload::RawPayload,
            ) -> ::core::result::Result<Self, $crate::error::ConversionError> {
                ::core::result::Result::Ok(Self {
                    entity_id: raw.field("entity_id")?,
                    $( $field: raw.struct_field(::core::stringify!($field))?, )*
                })
            }

            fn to_raw(&self) -> $crate::payload::RawPayload {
                #[allow(unused_mut)]
                let mut raw = $crate::payload::RawPayload::from_event(self);
                $(
                    raw.insert(
                        ::core::stringify!($field),
                        $crate::serde_json::to_value(&self.$field)
                            .unwrap_or($crate::serde_json::Value::Null),
                    );
                )*
                raw
            }
        }
    };
}
