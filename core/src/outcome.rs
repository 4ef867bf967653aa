//! Handler outcomes and the settlement actions they map to.
//!
//! | Handler result                 | Settlement                                   |
//! |--------------------------------|----------------------------------------------|
//! | `()` / `Outcome::Success`      | [`Settlement::Complete`]                     |
//! | `Outcome::Retry`               | [`Settlement::Abandon`]                      |
//! | `Outcome::Drop`                | [`Settlement::DeadLetter`] ("dropped by subscriber") |
//! | `Err(_)` / panic               | [`Settlement::Abandon`]                      |

use crate::error::HandlerError;
use std::fmt;

/// Dead-letter reason used when a handler returns [`Outcome::Drop`].
pub const DROPPED_BY_SUBSCRIBER: &str = "dropped by subscriber";

/// The result a handler reports after processing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Processed successfully; the message is completed.
    #[default]
    Success,

    /// Not processed; the message is abandoned and redelivered by the bus.
    Retry,

    /// Invalid message; it is moved to the dead-letter side channel.
    Drop,
}

/// The terminal disposition applied to a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Remove the message from the subscription.
    Complete,

    /// Release the lock so the bus redelivers the message.
    Abandon,

    /// Move the message to the dead-letter side channel.
    DeadLetter {
        /// Why the message was rejected
        reason: String,
    },
}

impl Settlement {
    /// Short action name used in logs and metric labels.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::DeadLetter { .. } => "dead_letter",
        }
    }
}

impl fmt::Display for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadLetter { reason } => write!(f, "dead_letter ({reason})"),
            other => f.write_str(other.action()),
        }
    }
}

impl From<Outcome> for Settlement {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Complete,
            Outcome::Retry => Self::Abandon,
            Outcome::Drop => Self::DeadLetter {
                reason: DROPPED_BY_SUBSCRIBER.to_string(),
            },
        }
    }
}

/// Values a handler may return.
///
/// Returning nothing counts as success, so `async fn on_x(evt: X) {}` is a
/// valid handler. `Result` errors are reported as handler failures.
pub trait IntoOutcome {
    /// Convert the handler's return value into an outcome.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the handler itself reported a failure.
    fn into_outcome(self) -> Result<Outcome, HandlerError>;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> Result<Outcome, HandlerError> {
        Ok(Outcome::Success)
    }
}

impl IntoOutcome for Outcome {
    fn into_outcome(self) -> Result<Outcome, HandlerError> {
        Ok(self)
    }
}

impl IntoOutcome for Option<Outcome> {
    fn into_outcome(self) -> Result<Outcome, HandlerError> {
        Ok(self.unwrap_or_default())
    }
}

impl<T, E> IntoOutcome for Result<T, E>
where
    T: IntoOutcome,
    E: fmt::Display,
{
    fn into_outcome(self) -> Result<Outcome, HandlerError> {
        match self {
            Ok(value) => value.into_outcome(),
            Err(e) => Err(HandlerError::new(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_settlements() {
        assert_eq!(Settlement::from(Outcome::Success), Settlement::Complete);
        assert_eq!(Settlement::from(Outcome::Retry), Settlement::Abandon);
        assert_eq!(
            Settlement::from(Outcome::Drop),
            Settlement::DeadLetter {
                reason: "dropped by subscriber".to_string()
            }
        );
    }

    #[test]
    fn unit_and_none_are_success() {
        assert_eq!(().into_outcome(), Ok(Outcome::Success));
        assert_eq!(None::<Outcome>.into_outcome(), Ok(Outcome::Success));
        assert_eq!(Some(Outcome::Drop).into_outcome(), Ok(Outcome::Drop));
    }

    #[test]
    fn result_errors_become_handler_errors() {
        let ok: Result<Outcome, String> = Ok(Outcome::Retry);
        assert_eq!(ok.into_outcome(), Ok(Outcome::Retry));

        let failed: Result<(), String> = Err("database unavailable".to_string());
        assert_eq!(
            failed.into_outcome(),
            Err(HandlerError::new("database unavailable"))
        );
    }

    #[test]
    fn settlement_display() {
        assert_eq!(Settlement::Complete.to_string(), "complete");
        assert_eq!(
            Settlement::from(Outcome::Drop).to_string(),
            "dead_letter (dropped by subscriber)"
        );
    }
}
