//! The per-subscription receive loop.
//!
//! ```text
//! Idle ──▶ Receiving ──▶ Dispatching ──▶ Idle
//!  │            │ (empty batch)            ▲
//!  │            └──────────────────────────┘
//!  └──▶ Stopped   (cancel seen between batches or during a receive backoff)
//! ```
//!
//! Every message of a batch is registered for lock renewal before any
//! handler runs. The batch is dispatched concurrently and fully settled
//! before the next receive.

use crate::error::ConsumerError;
use crate::lock_renewal::LockRenewer;
use crate::metrics::ConsumerMetrics;
use crate::retry::RetryPolicy;
use crate::settlement::SettlementAdapter;
use crate::shutdown::{CloseGuard, ShutdownHandle};
use crate::subscription::{RunnerSettings, SubscriptionDescriptor, SubscriptionKey};
use futures::future::join_all;
use pubsub_kit_core::bus::{ReceivedMessage, Receiver};
use pubsub_kit_core::outcome::Settlement;
use std::sync::Arc;
use std::time::Instant;

/// Settlement counts for one runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    /// Non-empty batches processed
    pub batches: u64,
    /// Messages completed
    pub completed: u64,
    /// Messages abandoned
    pub abandoned: u64,
    /// Messages dead-lettered
    pub dead_lettered: u64,
    /// Messages registered for lock renewal
    pub lock_registrations: u64,
}

impl RunnerStats {
    fn record(&mut self, settlement: &Settlement) {
        match settlement {
            Settlement::Complete => self.completed += 1,
            Settlement::Abandon => self.abandoned += 1,
            Settlement::DeadLetter { .. } => self.dead_lettered += 1,
        }
    }

    /// Total messages settled.
    #[must_use]
    pub const fn settled(&self) -> u64 {
        self.completed + self.abandoned + self.dead_lettered
    }
}

/// Drives one subscription until cancelled.
pub struct SubscriptionRunner {
    key: SubscriptionKey,
    adapter: Arc<SettlementAdapter>,
    receiver: Arc<dyn Receiver>,
    renewer: LockRenewer,
    settings: RunnerSettings,
    retry: RetryPolicy,
    shutdown: ShutdownHandle,
    close_guard: CloseGuard,
}

impl SubscriptionRunner {
    /// Create a runner for a descriptor and its receiver.
    ///
    /// The runner owns closing the receiver from here on, even if it is
    /// dropped without being run.
    #[must_use]
    pub fn new(
        descriptor: &SubscriptionDescriptor,
        receiver: Arc<dyn Receiver>,
        settings: RunnerSettings,
        retry: RetryPolicy,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            key: descriptor.key().clone(),
            adapter: descriptor.adapter(),
            close_guard: CloseGuard::receiver(Arc::clone(&receiver)),
            receiver,
            renewer: LockRenewer::new(descriptor.key().clone(), settings.max_lock_renewal),
            settings,
            retry,
            shutdown,
        }
    }

    /// Run until cancellation is observed or receiving fails for good.
    ///
    /// The receiver is closed on both paths, and on a spawned task if this
    /// future is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::ReceiveExhausted`] once receive retries run out.
    pub async fn run(self) -> Result<RunnerStats, ConsumerError> {
        tracing::info!(
            topic = self.key.topic(),
            subscription = self.key.subscription(),
            handler = self.adapter.handler_name(),
            max_batch_size = self.settings.max_batch_size,
            max_wait_ms = self.settings.max_wait_time.as_millis(),
            "Subscription runner started"
        );

        let result = self.poll_loop().await;
        self.close_guard.close().await;

        match &result {
            Ok(stats) => tracing::info!(
                topic = self.key.topic(),
                subscription = self.key.subscription(),
                batches = stats.batches,
                completed = stats.completed,
                abandoned = stats.abandoned,
                dead_lettered = stats.dead_lettered,
                "Subscription runner stopped"
            ),
            Err(error) => tracing::error!(
                topic = self.key.topic(),
                subscription = self.key.subscription(),
                error = %error,
                "Subscription runner failed"
            ),
        }

        result
    }

    async fn poll_loop(&self) -> Result<RunnerStats, ConsumerError> {
        let mut stats = RunnerStats::default();
        let mut failures = 0usize;

        while !self.shutdown.is_cancelled() {
            let batch = match self
                .receiver
                .receive_batch(self.settings.max_batch_size, self.settings.max_wait_time)
                .await
            {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(error) => {
                    ConsumerMetrics::record_receive_error(self.key.topic(), self.key.subscription());
                    if failures >= self.retry.max_retries {
                        return Err(ConsumerError::ReceiveExhausted {
                            topic: self.key.topic().to_string(),
                            subscription: self.key.subscription().to_string(),
                            attempts: failures + 1,
                            source: error,
                        });
                    }

                    let delay = self.retry.delay_for_attempt(failures);
                    tracing::warn!(
                        topic = self.key.topic(),
                        subscription = self.key.subscription(),
                        attempt = failures + 1,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Receive failed, retrying"
                    );
                    failures += 1;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.shutdown.cancelled() => break,
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                tracing::debug!(
                    topic = self.key.topic(),
                    subscription = self.key.subscription(),
                    "No messages received"
                );
                continue;
            }

            self.dispatch_batch(batch, &mut stats).await;
        }

        Ok(stats)
    }

    async fn dispatch_batch(&self, batch: Vec<ReceivedMessage>, stats: &mut RunnerStats) {
        let started = Instant::now();
        let size = batch.len();
        tracing::info!(
            topic = self.key.topic(),
            subscription = self.key.subscription(),
            size,
            "Received batch"
        );
        ConsumerMetrics::record_received(self.key.topic(), self.key.subscription(), size);

        // Register every message before any handler is polled.
        let dispatches: Vec<_> = batch
            .iter()
            .map(|message| {
                let guard = self.renewer.register(Arc::clone(&self.receiver), message);
                stats.lock_registrations += 1;
                async move {
                    let settlement = self.adapter.process(self.receiver.as_ref(), message).await;
                    drop(guard);
                    settlement
                }
            })
            .collect();

        for settlement in join_all(dispatches).await {
            stats.record(&settlement);
        }
        stats.batches += 1;

        let elapsed = started.elapsed();
        ConsumerMetrics::record_batch(self.key.topic(), self.key.subscription(), elapsed);
        tracing::info!(
            topic = self.key.topic(),
            subscription = self.key.subscription(),
            size,
            duration_ms = elapsed.as_millis(),
            "Batch settled"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ConsumerApp, ConsumerConfig};
    use chrono::{DateTime, Utc};
    use pubsub_kit_core::RawPayload;
    use pubsub_kit_core::bus::BusFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Hands out scripted batches, then waits out `max_wait` with nothing.
    #[derive(Default)]
    struct ScriptedReceiver {
        batches: Mutex<VecDeque<Vec<ReceivedMessage>>>,
        completed: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ScriptedReceiver {
        fn with_batch(self, ids: &[&str]) -> Self {
            let batch = ids
                .iter()
                .map(|id| {
                    let locked_until = Utc::now() + chrono::Duration::seconds(30);
                    ReceivedMessage::new(*id, format!(r#"{{"entity_id":"{id}"}}"#), locked_until)
                })
                .collect();
            self.batches.lock().unwrap().push_back(batch);
            self
        }
    }

    impl Receiver for ScriptedReceiver {
        fn topic(&self) -> &str {
            "task-pinged"
        }

        fn subscription(&self) -> &str {
            "TEST_SUB"
        }

        fn receive_batch(
            &self,
            _max_messages: usize,
            max_wait: Duration,
        ) -> BusFuture<'_, Vec<ReceivedMessage>> {
            Box::pin(async move {
                let next = self.batches.lock().unwrap().pop_front();
                if let Some(batch) = next {
                    return Ok(batch);
                }
                tokio::time::sleep(max_wait).await;
                Ok(Vec::new())
            })
        }

        fn complete<'a>(&'a self, _message: &'a ReceivedMessage) -> BusFuture<'a, ()> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn abandon<'a>(&'a self, _message: &'a ReceivedMessage) -> BusFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn dead_letter<'a>(
            &'a self,
            _message: &'a ReceivedMessage,
            _reason: &'a str,
        ) -> BusFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn renew_lock<'a>(&'a self, _message: &'a ReceivedMessage) -> BusFuture<'a, DateTime<Utc>> {
            Box::pin(async { Ok(Utc::now() + chrono::Duration::seconds(30)) })
        }

        fn close(&self) -> BusFuture<'_, ()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn app() -> ConsumerApp {
        let config = ConsumerConfig::new("TEST_SUB").with_max_wait_time(Duration::from_millis(10));
        let mut app = ConsumerApp::new(config);
        app.consume("on_task_pinged", |_raw: RawPayload| async {})
            .unwrap();
        app
    }

    fn runner(app: &ConsumerApp, receiver: &Arc<ScriptedReceiver>) -> SubscriptionRunner {
        let descriptor = app.subscriptions().next().unwrap();
        SubscriptionRunner::new(
            descriptor,
            Arc::clone(receiver) as Arc<dyn Receiver>,
            descriptor.settings(app.config()),
            RetryPolicy::default(),
            app.shutdown_handle(),
        )
    }

    #[tokio::test]
    async fn immediately_settled_messages_are_registered_for_renewal() {
        let app = app();
        let receiver = Arc::new(
            ScriptedReceiver::default()
                .with_batch(&["1", "2", "3"])
                .with_batch(&["4"]),
        );
        let shutdown = app.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        });

        let stats = runner(&app, &receiver).run().await.unwrap();

        assert_eq!(stats.batches, 2);
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.lock_registrations, 4);
        assert_eq!(receiver.completed.load(Ordering::SeqCst), 4);
        assert_eq!(receiver.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_runner_closes_its_receiver() {
        let app = app();
        let receiver = Arc::new(ScriptedReceiver::default());

        drop(runner(&app, &receiver));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(receiver.closed.load(Ordering::SeqCst), 1);
    }
}
