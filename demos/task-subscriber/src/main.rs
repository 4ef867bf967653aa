//! Task subscriber binary.
//!
//! Runs against an in-memory bus seeded with sample messages by default.
//! Build with `--features redpanda` to consume from the broker named by
//! `REDPANDA_BROKERS`.
//!
//! ```bash
//! DEFAULT_SUBSCRIPTION_NAME=task-subscriber cargo run -p task-subscriber
//! ```
//!
//! Prometheus metrics are rendered on shutdown; Ctrl+C stops the consumer
//! after its in-flight batches settle.

use anyhow::Context;
use pubsub_kit_core::MessageBus;
use pubsub_kit_runtime::metrics::MetricsRecorder;
use pubsub_kit_runtime::{ConfigError, ConsumerConfig};
use std::time::Duration;
use task_subscriber::build_app;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const FALLBACK_SUBSCRIPTION: &str = "task-subscriber";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pubsub_kit_runtime=info,task_subscriber=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ConsumerConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(key)) => {
            tracing::warn!(key, fallback = FALLBACK_SUBSCRIPTION, "Using fallback subscription");
            ConsumerConfig::new(FALLBACK_SUBSCRIPTION).with_max_wait_time(Duration::from_secs(1))
        }
        Err(e) => return Err(e).context("Invalid consumer configuration"),
    };

    let mut metrics = MetricsRecorder::new();
    metrics.install().context("Failed to install metrics recorder")?;

    let app = build_app(config).context("Failed to register handlers")?;
    let bus = bus()?;

    let shutdown = app.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, stopping...");
            shutdown.cancel();
        }
    });

    tracing::info!("Press Ctrl+C to exit");
    app.run(bus.as_ref()).await.context("Consumer failed")?;

    if let Some(text) = metrics.render() {
        println!("{text}");
    }
    Ok(())
}

#[cfg(not(feature = "redpanda"))]
fn bus() -> anyhow::Result<Box<dyn MessageBus>> {
    use pubsub_kit_testing::InMemoryBus;

    let subscription = std::env::var("DEFAULT_SUBSCRIPTION_NAME")
        .unwrap_or_else(|_| FALLBACK_SUBSCRIPTION.to_string());
    let bus = task_subscriber::sample_messages()
        .into_iter()
        .fold(InMemoryBus::new(), |bus, (topic, body)| {
            bus.with_message(topic, &subscription, body)
        });
    tracing::info!("Using in-memory bus with sample messages");
    Ok(Box::new(bus))
}

#[cfg(feature = "redpanda")]
fn bus() -> anyhow::Result<Box<dyn MessageBus>> {
    let bus = pubsub_kit_redpanda::RedpandaBus::from_env().context("Invalid Redpanda configuration")?;
    tracing::info!(brokers = bus.brokers(), "Using Redpanda bus");
    Ok(Box::new(bus))
}
