//! Task subscriber demo.
//!
//! Three handlers, one per payload shape:
//!
//! - `on_task_created` takes the concrete [`TaskCreated`] event
//! - `on_task_updated` takes an [`AnyEvent`] and downcasts it
//! - `on_user_created` takes the [`RawPayload`] and reads fields itself
//!
//! Topics come from the handler names: `task-created`, `task-updated` and
//! `user-created`.

use pubsub_kit_core::{
    AnyEvent, HandlerError, Outcome, RawPayload, RegistrationError, StateChangeEvent,
    state_change_event,
};
use pubsub_kit_runtime::{ConsumerApp, ConsumerConfig, consume};

state_change_event! {
    /// A task was created.
    pub struct TaskCreated {
        entity_type: "task",
        new_state: "created",
        /// Task title
        pub title: String,
    }
}

state_change_event! {
    /// A task changed.
    pub struct TaskUpdated {
        entity_type: "task",
        new_state: "updated",
        /// New title, if it changed
        pub title: Option<String>,
        /// New assignee, if it changed
        pub assignee: Option<String>,
    }
}

state_change_event! {
    /// A user signed up.
    pub struct UserCreated {
        entity_type: "user",
        new_state: "created",
        /// Contact address
        pub email: String,
    }
}

/// Tasks without a title are rejected.
pub async fn on_task_created(event: TaskCreated) -> Outcome {
    if event.title.trim().is_empty() {
        tracing::warn!(task_id = %event.entity_id, "Task has no title, dropping");
        return Outcome::Drop;
    }
    tracing::info!(task_id = %event.entity_id, title = %event.title, "Task created");
    Outcome::Success
}

/// Logs whichever fields changed.
///
/// # Errors
///
/// Returns a [`HandlerError`] if the event is not a [`TaskUpdated`].
pub async fn on_task_updated(event: AnyEvent) -> Result<(), HandlerError> {
    let entity_id = event.entity_id().to_string();
    let update = event
        .downcast::<TaskUpdated>()
        .ok_or_else(|| HandlerError::new(format!("unexpected event for task {entity_id}")))?;

    tracing::info!(
        task_id = %update.entity_id,
        title = ?update.title,
        assignee = ?update.assignee,
        "Task updated"
    );
    Ok(())
}

/// Malformed addresses are rejected; a missing one is retried.
///
/// # Errors
///
/// Returns a [`HandlerError`] if the payload has no `email` field.
pub async fn on_user_created(raw: RawPayload) -> Result<Outcome, HandlerError> {
    let email: String = raw
        .field("email")
        .map_err(|e| HandlerError::new(e.to_string()))?;
    if !email.contains('@') {
        tracing::warn!(email = %email, "Invalid email, dropping");
        return Ok(Outcome::Drop);
    }
    tracing::info!(email = %email, "User created");
    Ok(Outcome::Success)
}

/// Build the consumer with every event type and handler registered.
///
/// # Errors
///
/// Returns [`RegistrationError`] if a registration is rejected.
pub fn build_app(config: ConsumerConfig) -> Result<ConsumerApp, RegistrationError> {
    let mut app = ConsumerApp::new(config);
    app.register_event_type::<TaskCreated>()?;
    app.register_event_type::<TaskUpdated>()?;
    app.register_event_type::<UserCreated>()?;

    consume!(app, on_task_created)?;
    consume!(app, on_task_updated)?;
    consume!(app, on_user_created)?;
    Ok(app)
}

/// Sample `(topic, body)` pairs for a local run.
#[must_use]
pub fn sample_messages() -> Vec<(&'static str, &'static str)> {
    vec![
        ("task-created", r#"{"entity_id":"123","title":"Write docs"}"#),
        ("task-created", r#"{"entity_id":"124","title":""}"#),
        ("task-updated", r#"{"entity_id":"123","assignee":"sam"}"#),
        ("user-created", r#"{"entity_id":"u-1","email":"sam@example.com"}"#),
        ("user-created", r#"{"entity_id":"u-2","email":"not-an-address"}"#),
    ]
}
