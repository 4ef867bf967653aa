//! The settlement adapter.
//!
//! Wraps a typed handler so the runner can drive it with raw messages:
//!
//! 1. parse the body as a JSON object
//! 2. convert it to the handler's payload type
//! 3. call the handler
//! 4. map the result to a [`Settlement`] and apply it to the receiver
//!
//! Parse errors, conversion errors, handler errors and panics all end in
//! `abandon`. Settlement call failures are logged; the adapter never returns
//! an error to the runner.

use crate::error::DispatchError;
use crate::metrics::ConsumerMetrics;
use crate::subscription::SubscriptionKey;
use futures::FutureExt;
use futures::future::BoxFuture;
use pubsub_kit_core::bus::{ReceivedMessage, Receiver};
use pubsub_kit_core::error::BusError;
use pubsub_kit_core::outcome::{IntoOutcome, Outcome, Settlement};
use pubsub_kit_core::payload::{Payload, PayloadConverter, RawPayload};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Type-erased handler: converted and invoked from a raw payload.
type ErasedHandler =
    Arc<dyn Fn(RawPayload) -> BoxFuture<'static, Result<Outcome, DispatchError>> + Send + Sync>;

/// Failure boundary between a runner and a handler.
pub struct SettlementAdapter {
    key: SubscriptionKey,
    handler_name: String,
    handler: ErasedHandler,
}

impl SettlementAdapter {
    /// Wrap a handler and its payload converter.
    pub fn new<P, F, Fut, R>(
        key: SubscriptionKey,
        handler_name: impl Into<String>,
        converter: PayloadConverter<P>,
        handler: F,
    ) -> Self
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoOutcome + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |raw: RawPayload| {
            let handler = Arc::clone(&handler);
            let converter = Arc::clone(&converter);
            Box::pin(async move {
                let payload = converter(raw).map_err(DispatchError::Conversion)?;
                handler(payload)
                    .await
                    .into_outcome()
                    .map_err(DispatchError::Handler)
            }) as BoxFuture<'static, Result<Outcome, DispatchError>>
        });

        Self {
            key,
            handler_name: handler_name.into(),
            handler: erased,
        }
    }

    /// The subscription this adapter serves.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// The wrapped handler's name.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// Run parse, conversion and the handler, catching panics.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] for any failure before an outcome is known.
    pub async fn dispatch(&self, message: &ReceivedMessage) -> Result<Outcome, DispatchError> {
        let raw = RawPayload::parse(&message.body).map_err(DispatchError::Parse)?;
        let invocation = (self.handler)(raw);

        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    /// Decide the settlement for a message.
    pub async fn decide(&self, message: &ReceivedMessage) -> Settlement {
        match self.dispatch(message).await {
            Ok(outcome) => Settlement::from(outcome),
            Err(error) => {
                tracing::warn!(
                    topic = self.key.topic(),
                    subscription = self.key.subscription(),
                    handler = %self.handler_name,
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    error = %error,
                    "Message processing failed, abandoning"
                );
                Settlement::Abandon
            }
        }
    }

    /// Decide and apply the settlement for a message.
    ///
    /// Exactly one settlement call is made. Its failure is logged, not returned.
    pub async fn process(&self, receiver: &dyn Receiver, message: &ReceivedMessage) -> Settlement {
        let settlement = self.decide(message).await;

        match settle(receiver, message, &settlement).await {
            Ok(()) => {
                tracing::info!(
                    topic = self.key.topic(),
                    subscription = self.key.subscription(),
                    handler = %self.handler_name,
                    message_id = %message.message_id,
                    action = settlement.action(),
                    "Message settled"
                );
                ConsumerMetrics::record_settled(
                    self.key.topic(),
                    self.key.subscription(),
                    settlement.action(),
                );
            }
            Err(error) => {
                tracing::warn!(
                    topic = self.key.topic(),
                    subscription = self.key.subscription(),
                    message_id = %message.message_id,
                    action = settlement.action(),
                    error = %error,
                    "Settlement failed, the message will be redelivered once its lock expires"
                );
            }
        }

        settlement
    }
}

impl std::fmt::Debug for SettlementAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementAdapter")
            .field("key", &self.key)
            .field("handler_name", &self.handler_name)
            .finish_non_exhaustive()
    }
}

async fn settle(
    receiver: &dyn Receiver,
    message: &ReceivedMessage,
    settlement: &Settlement,
) -> Result<(), BusError> {
    match settlement {
        Settlement::Complete => receiver.complete(message).await,
        Settlement::Abandon => receiver.abandon(message).await,
        Settlement::DeadLetter { reason } => receiver.dead_letter(message, reason).await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pubsub_kit_core::error::HandlerError;
    use pubsub_kit_core::payload::converter_for;
    use pubsub_kit_core::registry::EventTypeRegistry;
    use pubsub_kit_core::state_change_event;

    state_change_event! {
        struct TaskCreated {
            entity_type: "task",
            new_state: "created",
        }
    }

    async fn explode(_: TaskCreated) -> Outcome {
        panic!("handler exploded")
    }

    fn message(body: &str) -> ReceivedMessage {
        ReceivedMessage::new("msg-1", body, chrono::Utc::now())
    }

    fn adapter<P, F, Fut, R>(handler: F) -> SettlementAdapter
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoOutcome + 'static,
    {
        let mut registry = EventTypeRegistry::new();
        registry.register::<TaskCreated>().unwrap();
        let converter = converter_for::<P>(&registry, "task-created", "on_task_created").unwrap();
        SettlementAdapter::new(
            SubscriptionKey::new("task-created", "TEST_SUB"),
            "on_task_created",
            converter,
            handler,
        )
    }

    #[tokio::test]
    async fn outcomes_map_to_settlements() {
        let success = adapter(|_: TaskCreated| async {});
        let retry = adapter(|_: TaskCreated| async { Outcome::Retry });
        let drop = adapter(|_: TaskCreated| async { Outcome::Drop });
        let msg = message(r#"{"entity_id":"123"}"#);

        assert_eq!(success.decide(&msg).await, Settlement::Complete);
        assert_eq!(retry.decide(&msg).await, Settlement::Abandon);
        assert_eq!(
            drop.decide(&msg).await,
            Settlement::DeadLetter {
                reason: "dropped by subscriber".to_string()
            }
        );
    }

    #[tokio::test]
    async fn handler_receives_converted_event() {
        let adapter = adapter(|event: TaskCreated| async move {
            if event.entity_id == "123" {
                Ok(Outcome::Success)
            } else {
                Err(HandlerError::new("wrong entity"))
            }
        });
        assert_eq!(
            adapter.dispatch(&message(r#"{"entity_id":"123"}"#)).await,
            Ok(Outcome::Success)
        );
    }

    #[tokio::test]
    async fn failures_abandon() {
        let failing = adapter(|_: TaskCreated| async { Err::<(), _>("boom") });
        let msg = message(r#"{"entity_id":"1"}"#);
        assert!(matches!(failing.dispatch(&msg).await, Err(DispatchError::Handler(_))));
        assert_eq!(failing.decide(&msg).await, Settlement::Abandon);

        let ok = adapter(|_: TaskCreated| async {});
        assert!(matches!(
            ok.dispatch(&message("not json")).await,
            Err(DispatchError::Parse(_))
        ));
        assert!(matches!(
            ok.dispatch(&message(r#"{"id":"1"}"#)).await,
            Err(DispatchError::Conversion(_))
        ));
    }

    #[tokio::test]
    async fn panics_are_caught() {
        let panicking = adapter(explode);
        let result = panicking.dispatch(&message(r#"{"entity_id":"1"}"#)).await;
        assert_eq!(
            result,
            Err(DispatchError::Panicked("handler exploded".to_string()))
        );
    }

    #[tokio::test]
    async fn raw_handlers_see_the_parsed_body() {
        let raw = adapter(|payload: RawPayload| async move {
            if payload.contains_key("anything") {
                Outcome::Success
            } else {
                Outcome::Drop
            }
        });
        assert_eq!(
            raw.decide(&message(r#"{"anything":true}"#)).await,
            Settlement::Complete
        );
    }
}
