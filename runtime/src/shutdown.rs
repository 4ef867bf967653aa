//! Cooperative cancellation and bus teardown.
//!
//! [`ShutdownHandle`] is the cancel flag shared by the app and its runners.
//! Runners poll it between batches and await [`ShutdownHandle::cancelled`]
//! while backing off.
//!
//! [`CloseGuard`] owns a bus connection or receiver until it is closed. If
//! the future holding it is dropped first (a `timeout` or `select!` around
//! `run`), the close is spawned onto the current runtime instead.

use pubsub_kit_core::bus::{BusConnection, Receiver};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct ShutdownState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancels a running [`ConsumerApp`](crate::ConsumerApp) from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    state: Arc<ShutdownState>,
}

impl ShutdownHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::default(),
        }
    }

    /// Ask every runner to stop after its current batch.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            tracing::info!("Consumer shutdown requested");
            self.state.notify.notify_waiters();
        }
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent cancel is not missed.
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

enum Closable {
    Connection(Arc<dyn BusConnection>),
    Receiver(Arc<dyn Receiver>),
}

impl Closable {
    async fn close(self) {
        match self {
            Self::Connection(connection) => {
                if let Err(error) = connection.close().await {
                    tracing::warn!(error = %error, "Failed to close bus connection");
                }
            }
            Self::Receiver(receiver) => {
                if let Err(error) = receiver.close().await {
                    tracing::warn!(
                        topic = receiver.topic(),
                        subscription = receiver.subscription(),
                        error = %error,
                        "Failed to close receiver"
                    );
                }
            }
        }
    }
}

/// Closes a bus resource exactly once, on drop if not closed explicitly.
pub(crate) struct CloseGuard(Option<Closable>);

impl CloseGuard {
    pub(crate) fn connection(connection: Arc<dyn BusConnection>) -> Self {
        Self(Some(Closable::Connection(connection)))
    }

    pub(crate) fn receiver(receiver: Arc<dyn Receiver>) -> Self {
        Self(Some(Closable::Receiver(receiver)))
    }

    /// Close now.
    pub(crate) async fn close(mut self) {
        if let Some(closable) = self.0.take() {
            closable.close().await;
        }
    }

    /// Hand responsibility for closing to another owner.
    pub(crate) fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(closable) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!("Consumer dropped while running, closing bus resources");
                runtime.spawn(closable.close());
            }
            Err(_) => tracing::warn!("No runtime to close bus resources on"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_resolves_for_waiters_registered_before_cancel() {
        let handle = ShutdownHandle::new();
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_at_once_after_cancel() {
        let handle = ShutdownHandle::new();
        handle.cancel();
        handle.cancel();

        tokio::time::timeout(Duration::from_millis(50), handle.cancelled())
            .await
            .unwrap();
    }
}
