//! Helpers for running a consumer inside a test.

use pubsub_kit_core::bus::MessageBus;
use pubsub_kit_runtime::{ConsumerApp, ConsumerError, SubscriptionKey};
use std::collections::HashSet;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Run every subscription of `app`, cancelling it after `duration`.
///
/// Batches in flight when the timer fires are settled before this returns.
///
/// # Errors
///
/// Whatever [`ConsumerApp::run`] returns.
pub async fn run_for(
    app: &ConsumerApp,
    bus: &dyn MessageBus,
    duration: Duration,
) -> Result<(), ConsumerError> {
    run_filtered_for(app, bus, None, duration).await
}

/// Run the filtered subscriptions of `app`, cancelling it after `duration`.
///
/// # Errors
///
/// Whatever [`ConsumerApp::run_filtered`] returns.
pub async fn run_filtered_for(
    app: &ConsumerApp,
    bus: &dyn MessageBus,
    filter: Option<&HashSet<SubscriptionKey>>,
    duration: Duration,
) -> Result<(), ConsumerError> {
    let shutdown = app.shutdown_handle();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        shutdown.cancel();
    });

    let result = app.run_filtered(bus, filter).await;
    timer.abort();
    result
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
