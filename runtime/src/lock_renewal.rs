//! Automatic lock renewal for in-flight messages.
//!
//! Each runner owns one [`LockRenewer`]. Registering a message spawns a task
//! that renews its lock shortly before expiry until the returned
//! [`RenewalGuard`] is dropped or the renewal limit elapses. A failed renewal
//! stops renewing that message; its lock then expires and the bus redelivers
//! it.

use crate::metrics::LockRenewalMetrics;
use crate::subscription::SubscriptionKey;
use chrono::Utc;
use pubsub_kit_core::bus::{ReceivedMessage, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// Renew this long before the lock expires.
const RENEWAL_MARGIN: Duration = Duration::from_secs(10);

/// Never renew more often than this.
const MIN_RENEWAL_DELAY: Duration = Duration::from_millis(10);

/// Registers messages for lock renewal.
#[derive(Debug, Clone)]
pub struct LockRenewer {
    key: SubscriptionKey,
    max_lock_renewal: Duration,
}

impl LockRenewer {
    /// Create a renewer for one subscription.
    #[must_use]
    pub const fn new(key: SubscriptionKey, max_lock_renewal: Duration) -> Self {
        Self {
            key,
            max_lock_renewal,
        }
    }

    /// The total renewal limit per message.
    #[must_use]
    pub const fn max_lock_renewal(&self) -> Duration {
        self.max_lock_renewal
    }

    /// Start renewing a message's lock.
    ///
    /// Renewal stops when the guard is dropped. Must be called inside a Tokio
    /// runtime.
    #[must_use = "dropping the guard stops renewal immediately"]
    pub fn register(&self, receiver: Arc<dyn Receiver>, message: &ReceivedMessage) -> RenewalGuard {
        tracing::debug!(
            topic = self.key.topic(),
            subscription = self.key.subscription(),
            message_id = %message.message_id,
            locked_until = %message.locked_until,
            "Registered message for lock renewal"
        );

        let deadline = Instant::now() + self.max_lock_renewal;
        let task = tokio::spawn(renew_until(
            self.key.clone(),
            receiver,
            message.clone(),
            deadline,
        ));
        RenewalGuard { task }
    }
}

/// Stops renewing a message's lock when dropped.
#[derive(Debug)]
pub struct RenewalGuard {
    task: JoinHandle<()>,
}

impl RenewalGuard {
    /// Whether the renewal task has stopped on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn renew_until(
    key: SubscriptionKey,
    receiver: Arc<dyn Receiver>,
    mut message: ReceivedMessage,
    deadline: Instant,
) {
    loop {
        let remaining = (message.locked_until - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let wake_at = Instant::now() + renewal_delay(remaining);
        if wake_at >= deadline {
            tracing::debug!(
                topic = key.topic(),
                subscription = key.subscription(),
                message_id = %message.message_id,
                "Lock renewal limit reached"
            );
            return;
        }

        sleep_until(wake_at).await;

        match receiver.renew_lock(&message).await {
            Ok(locked_until) => {
                message.locked_until = locked_until;
                LockRenewalMetrics::record_renewal();
                tracing::trace!(
                    message_id = %message.message_id,
                    locked_until = %locked_until,
                    "Renewed message lock"
                );
            }
            Err(error) => {
                LockRenewalMetrics::record_failure();
                tracing::warn!(
                    topic = key.topic(),
                    subscription = key.subscription(),
                    message_id = %message.message_id,
                    error = %error,
                    "Lock renewal failed, the message will be redelivered once its lock expires"
                );
                return;
            }
        }
    }
}

/// How long to wait before renewing a lock that expires in `remaining`.
pub(crate) fn renewal_delay(remaining: Duration) -> Duration {
    let delay = if remaining > RENEWAL_MARGIN * 2 {
        remaining - RENEWAL_MARGIN
    } else {
        remaining / 2
    };
    delay.max(MIN_RENEWAL_DELAY)
}
