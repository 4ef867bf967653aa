//! Prometheus metrics for the consumer engine.
//!
//! Metrics are emitted through the `metrics` facade, so they are no-ops until
//! a recorder is installed. [`MetricsRecorder::install`] installs the Prometheus
//! recorder, and [`MetricsRecorder::render`] produces the text exposition for
//! whatever serves or logs it:
//!
//! - `pubsub_messages_received_total{topic, subscription}`
//! - `pubsub_messages_settled_total{topic, subscription, action}`
//! - `pubsub_batch_duration_seconds{topic, subscription}`
//! - `pubsub_lock_renewals_total` / `pubsub_lock_renewal_failures_total`
//! - `pubsub_receive_errors_total{topic, subscription}`
//! - `pubsub_messages_published_total{topic}`
//!
//! # Example
//!
//! ```rust,no_run
//! use pubsub_kit_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//!
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs the Prometheus recorder and keeps its render handle.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// A recorder that is not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// An already installed recorder is not an error.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// The Prometheus handle, if this instance installed the recorder.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "pubsub_messages_received_total",
        "Total number of messages received from subscriptions"
    );
    describe_counter!(
        "pubsub_messages_settled_total",
        "Total number of messages settled, by action"
    );
    describe_histogram!(
        "pubsub_batch_duration_seconds",
        "Time taken to dispatch and settle a batch"
    );
    describe_counter!(
        "pubsub_lock_renewals_total",
        "Total number of successful message lock renewals"
    );
    describe_counter!(
        "pubsub_lock_renewal_failures_total",
        "Total number of failed message lock renewals"
    );
    describe_counter!(
        "pubsub_receive_errors_total",
        "Total number of failed batch receive calls"
    );
    describe_counter!(
        "pubsub_messages_published_total",
        "Total number of messages published"
    );
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a received batch.
    pub fn record_received(topic: &str, subscription: &str, count: usize) {
        counter!(
            "pubsub_messages_received_total",
            "topic" => topic.to_string(),
            "subscription" => subscription.to_string()
        )
        .increment(count as u64);
    }

    /// Record a settlement decision.
    pub fn record_settled(topic: &str, subscription: &str, action: &'static str) {
        counter!(
            "pubsub_messages_settled_total",
            "topic" => topic.to_string(),
            "subscription" => subscription.to_string(),
            "action" => action
        )
        .increment(1);
    }

    /// Record how long a batch took to drain.
    pub fn record_batch(topic: &str, subscription: &str, duration: Duration) {
        histogram!(
            "pubsub_batch_duration_seconds",
            "topic" => topic.to_string(),
            "subscription" => subscription.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed receive call.
    pub fn record_receive_error(topic: &str, subscription: &str) {
        counter!(
            "pubsub_receive_errors_total",
            "topic" => topic.to_string(),
            "subscription" => subscription.to_string()
        )
        .increment(1);
    }
}

/// Lock renewal metrics recorder.
pub struct LockRenewalMetrics;

impl LockRenewalMetrics {
    /// Record a successful renewal.
    pub fn record_renewal() {
        counter!("pubsub_lock_renewals_total").increment(1);
    }

    /// Record a failed renewal.
    pub fn record_failure() {
        counter!("pubsub_lock_renewal_failures_total").increment(1);
    }
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a published message.
    pub fn record_publish(topic: &str) {
        counter!("pubsub_messages_published_total", "topic" => topic.to_string()).increment(1);
    }
}
