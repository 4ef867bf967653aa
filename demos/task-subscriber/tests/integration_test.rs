//! Runs the demo consumer against the in-memory bus.

#![allow(clippy::unwrap_used)]

use pubsub_kit_core::{DROPPED_BY_SUBSCRIBER, Settlement};
use pubsub_kit_runtime::ConsumerConfig;
use pubsub_kit_testing::{InMemoryBus, init_test_tracing, run_for};
use std::time::Duration;
use task_subscriber::{build_app, sample_messages};

const SUB: &str = "TEST_SUB";

fn settlements(bus: &InMemoryBus, topic: &str) -> Vec<Settlement> {
    bus.settlements(topic, SUB)
        .into_iter()
        .map(|record| record.settlement)
        .collect()
}

#[tokio::test]
async fn sample_messages_settle_as_expected() {
    init_test_tracing();
    let bus = sample_messages()
        .into_iter()
        .fold(InMemoryBus::new(), |bus, (topic, body)| {
            bus.with_message(topic, SUB, body)
        });
    let app = build_app(ConsumerConfig::new(SUB).with_max_wait_time(Duration::from_millis(20)))
        .unwrap();

    let topics: Vec<_> = app.subscriptions().map(|d| d.topic().to_string()).collect();
    assert_eq!(topics, vec!["task-created", "task-updated", "user-created"]);

    run_for(&app, &bus, Duration::from_millis(200)).await.unwrap();

    let dropped = Settlement::DeadLetter {
        reason: DROPPED_BY_SUBSCRIBER.to_string(),
    };
    let mut created = settlements(&bus, "task-created");
    created.sort_by_key(|s| s.action());
    assert_eq!(created, vec![Settlement::Complete, dropped.clone()]);
    assert_eq!(settlements(&bus, "task-updated"), vec![Settlement::Complete]);
    let mut users = settlements(&bus, "user-created");
    users.sort_by_key(|s| s.action());
    assert_eq!(users, vec![Settlement::Complete, dropped]);
}

#[tokio::test]
async fn user_without_email_is_abandoned() {
    init_test_tracing();
    let bus = InMemoryBus::new().with_message("user-created", SUB, r#"{"entity_id":"u-3"}"#);
    let app = build_app(ConsumerConfig::new(SUB).with_max_wait_time(Duration::from_millis(20)))
        .unwrap();

    run_for(&app, &bus, Duration::from_millis(100)).await.unwrap();

    assert_eq!(settlements(&bus, "user-created"), vec![Settlement::Abandon]);
}
