//! Integration tests for the consumer lifecycle
//!
//! Registration failures, startup errors, cancellation, lock renewal and
//! receive retry behavior.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use pubsub_kit_core::outcome::Settlement;
use pubsub_kit_core::{AnyEvent, RegistrationError, state_change_event};
use pubsub_kit_runtime::{
    ConsumeOptions, ConsumerApp, ConsumerConfig, ConsumerError, RetryPolicy, SubscriptionKey,
};
use pubsub_kit_testing::{InMemoryBus, init_test_tracing, run_filtered_for, run_for};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Test Fixtures
// ============================================================================

state_change_event! {
    /// A task was created.
    pub struct TaskCreated {
        entity_type: "task",
        new_state: "created",
    }
}

state_change_event! {
    /// A user was created.
    pub struct UserCreated {
        entity_type: "user",
        new_state: "created",
    }
}

const SUB: &str = "TEST_SUB";
const RUN: Duration = Duration::from_millis(150);

fn app() -> ConsumerApp {
    init_test_tracing();
    let config = ConsumerConfig::new(SUB).with_max_wait_time(Duration::from_millis(20));
    let mut app = ConsumerApp::new(config);
    app.register_event_type::<TaskCreated>().unwrap();
    app.register_event_type::<UserCreated>().unwrap();
    app
}

async fn on_task_created(_event: TaskCreated) {}

async fn on_user_created(_event: UserCreated) {}

async fn slow(_event: TaskCreated) {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

fn actions(bus: &InMemoryBus, topic: &str) -> Vec<&'static str> {
    bus.settlements(topic, SUB)
        .iter()
        .map(|record| record.settlement.action())
        .collect()
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn handler_names_must_follow_the_convention() {
    let mut app = app();
    let error = assert_err!(app.consume("handle_task", on_task_created));
    assert!(matches!(error, RegistrationError::NamingConvention { .. }));
    assert_eq!(app.subscriptions().count(), 0);
}

#[test]
fn duplicate_pairs_are_rejected() {
    let mut app = app();
    app.consume("on_task_created", on_task_created).unwrap();

    let error = assert_err!(app.consume("on_task_created", on_task_created));
    assert!(matches!(
        error,
        RegistrationError::DuplicateSubscription { ref topic, ref subscription }
            if topic == "task-created" && subscription == SUB
    ));

    // Same topic on another subscription is fine.
    app.consume_with(ConsumeOptions::new().subscription("audit"))
        .bind("on_task_created", on_task_created)
        .unwrap();
    assert_eq!(app.subscriptions().count(), 2);
}

#[test]
fn unregistered_payload_types_are_rejected() {
    init_test_tracing();
    let mut app = ConsumerApp::new(ConsumerConfig::new(SUB));

    let error = app.consume("on_task_created", on_task_created).unwrap_err();
    assert!(matches!(
        error,
        RegistrationError::UnsupportedPayloadType { type_name, .. } if type_name.ends_with("TaskCreated")
    ));

    let error = app
        .consume("on_task_created", |_event: AnyEvent| async {})
        .unwrap_err();
    assert!(matches!(error, RegistrationError::UnknownEventType { ref topic, .. } if topic == "task-created"));
}

#[test]
fn empty_names_are_rejected() {
    let mut app = app();
    let error = app
        .consume_with(ConsumeOptions::new().topic(""))
        .bind("import", on_task_created)
        .unwrap_err();
    assert_eq!(error, RegistrationError::EmptyName("topic"));

    let error = app
        .consume_with(ConsumeOptions::new().subscription(""))
        .bind("on_task_created", on_task_created)
        .unwrap_err();
    assert_eq!(error, RegistrationError::EmptyName("subscription"));
}

#[test]
fn overrides_shadow_engine_defaults() {
    let mut app = app();
    let key = app
        .consume_with(
            ConsumeOptions::new()
                .max_batch_size(3)
                .max_wait_time(Duration::from_secs(1)),
        )
        .bind("on_task_created", on_task_created)
        .unwrap();

    let descriptor = app.subscriptions().find(|d| d.key() == &key).unwrap();
    let settings = descriptor.settings(app.config());
    assert_eq!(settings.max_batch_size, 3);
    assert_eq!(settings.max_wait_time, Duration::from_secs(1));
    assert_eq!(settings.max_lock_renewal, app.config().max_lock_renewal);
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn run_without_subscriptions_fails() {
    let app = app();
    let bus = InMemoryBus::new();
    let result = app.run(&bus).await;
    assert!(matches!(result, Err(ConsumerError::NoSubscriptions)));
    assert_eq!(bus.connections_opened(), 0);
}

#[tokio::test]
async fn run_after_cancel_fails() {
    let mut app = app();
    app.consume("on_task_created", on_task_created).unwrap();
    app.cancel();

    let bus = InMemoryBus::new();
    let result = app.run(&bus).await;
    assert!(matches!(result, Err(ConsumerError::Cancelled)));
    assert_eq!(bus.connections_opened(), 0);
}

#[tokio::test]
async fn concurrent_runs_are_rejected() {
    let mut app = app();
    app.consume("on_task_created", on_task_created).unwrap();
    let bus = InMemoryBus::new();

    let (first, second) = tokio::join!(run_for(&app, &bus, RUN), run_for(&app, &bus, RUN));

    assert!(first.is_ok());
    assert!(matches!(second, Err(ConsumerError::AlreadyRunning)));
    assert_eq!(bus.connections_opened(), 1);
}

#[tokio::test]
async fn connect_failure_opens_no_receivers() {
    let mut app = app();
    app.consume("on_task_created", on_task_created).unwrap();
    let bus = InMemoryBus::new().failing_connect("broker unreachable");

    let result = app.run(&bus).await;

    assert!(matches!(result, Err(ConsumerError::Connection(_))));
    assert!(bus.receivers_opened().is_empty());
}

#[tokio::test]
async fn receiver_failure_closes_opened_receivers_and_connection() {
    let mut app = app();
    app.consume("on_task_created", on_task_created).unwrap();
    app.consume("on_user_created", on_user_created).unwrap();
    let bus = InMemoryBus::new().failing_receiver("user-created", SUB);

    let result = app.run(&bus).await;

    assert!(matches!(result, Err(ConsumerError::Receiver(_))));
    assert_eq!(bus.receivers_opened().len(), 1);
    assert_eq!(bus.receivers_closed(), 1);
    assert_eq!(bus.connections_closed(), 1);
}

#[tokio::test]
async fn receivers_and_connection_are_closed_after_run() {
    let mut app = app();
    app.consume("on_task_created", on_task_created).unwrap();
    app.consume("on_user_created", on_user_created).unwrap();
    let bus = InMemoryBus::new()
        .with_message("task-created", SUB, r#"{"entity_id":"1"}"#)
        .with_message("user-created", SUB, r#"{"entity_id":"2"}"#);

    assert_ok!(run_for(&app, &bus, RUN).await);

    assert_eq!(actions(&bus, "task-created"), vec!["complete"]);
    assert_eq!(actions(&bus, "user-created"), vec!["complete"]);
    assert_eq!(bus.receivers_opened().len(), 2);
    assert_eq!(bus.receivers_closed(), 2);
    assert_eq!(bus.connections_opened(), 1);
    assert_eq!(bus.connections_closed(), 1);
}

#[tokio::test]
async fn dropping_run_still_closes_connection_and_receivers() {
    let mut app = app();
    app.consume("on_task_created", slow).unwrap();
    app.consume("on_user_created", on_user_created).unwrap();
    let bus = InMemoryBus::new().with_message("task-created", SUB, r#"{"entity_id":"1"}"#);

    assert_err!(tokio::time::timeout(Duration::from_millis(60), app.run(&bus)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bus.receivers_opened().len(), 2);
    assert_eq!(bus.receivers_closed(), 2);
    assert_eq!(bus.connections_opened(), 1);
    assert_eq!(bus.connections_closed(), 1);
    assert!(!app.is_cancelled());
}

// ============================================================================
// Filtering
// ============================================================================

#[tokio::test]
async fn filter_runs_only_selected_subscriptions() {
    let mut app = app();
    let task_key = app.consume("on_task_created", on_task_created).unwrap();
    app.consume("on_user_created", on_user_created).unwrap();
    let bus = InMemoryBus::new()
        .with_message("task-created", SUB, r#"{"entity_id":"1"}"#)
        .with_message("user-created", SUB, r#"{"entity_id":"2"}"#);

    let filter: HashSet<SubscriptionKey> = [task_key].into_iter().collect();
    run_filtered_for(&app, &bus, Some(&filter), RUN).await.unwrap();

    assert_eq!(
        bus.receivers_opened(),
        vec![("task-created".to_string(), SUB.to_string())]
    );
    assert_eq!(actions(&bus, "task-created"), vec!["complete"]);
    assert_eq!(bus.pending("user-created", SUB), 1);
}

#[tokio::test]
async fn filter_matching_nothing_returns_without_connecting() {
    let mut app = app();
    app.consume("on_task_created", on_task_created).unwrap();
    let bus = InMemoryBus::new();

    let filter: HashSet<SubscriptionKey> = ["other|TEST_SUB".parse().unwrap()].into_iter().collect();
    run_filtered_for(&app, &bus, Some(&filter), RUN).await.unwrap();

    assert_eq!(bus.connections_opened(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancel_settles_the_in_flight_batch() {
    let mut app = app();
    app.consume_with(ConsumeOptions::new().max_batch_size(2))
        .bind("on_task_created", slow)
        .unwrap();
    let bus = InMemoryBus::new().with_messages(
        "task-created",
        SUB,
        [
            r#"{"entity_id":"1"}"#,
            r#"{"entity_id":"2"}"#,
            r#"{"entity_id":"3"}"#,
        ],
    );

    run_for(&app, &bus, Duration::from_millis(50)).await.unwrap();

    assert_eq!(actions(&bus, "task-created"), vec!["complete", "complete"]);
    assert_eq!(bus.pending("task-created", SUB), 1);
    assert!(app.is_cancelled());
}

#[tokio::test]
async fn shutdown_handle_stops_an_idle_consumer() {
    let mut app = app();
    app.consume("on_task_created", on_task_created).unwrap();
    let bus = InMemoryBus::new();
    let handle = app.shutdown_handle();

    let started = Instant::now();
    let (result, ()) = tokio::join!(app.run(&bus), async {
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.cancel();
    });

    assert_ok!(result);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(bus.receivers_closed(), 1);
}

// ============================================================================
// Lock renewal
// ============================================================================

#[tokio::test]
async fn locks_are_renewed_while_the_handler_runs() {
    let mut app = app();
    app.consume("on_task_created", slow).unwrap();
    let bus = InMemoryBus::new().with_lock_duration(Duration::from_millis(100));
    let id = bus.add_message("task-created", SUB, r#"{"entity_id":"1"}"#);

    run_for(&app, &bus, Duration::from_millis(50)).await.unwrap();

    assert!(bus.lock_renewals(&id) >= 2, "renewals: {}", bus.lock_renewals(&id));
    assert_eq!(
        bus.settlements("task-created", SUB)[0].settlement,
        Settlement::Complete
    );
}

#[tokio::test]
async fn lock_renewal_stops_at_the_limit() {
    let mut app = app();
    app.consume_with(ConsumeOptions::new().max_lock_renewal(Duration::from_millis(120)))
        .bind("on_task_created", slow)
        .unwrap();
    let bus = InMemoryBus::new().with_lock_duration(Duration::from_millis(50));
    let id = bus.add_message("task-created", SUB, r#"{"entity_id":"1"}"#);

    run_for(&app, &bus, Duration::from_millis(50)).await.unwrap();

    let renewals = bus.lock_renewals(&id);
    assert!((1..=5).contains(&renewals), "renewals: {renewals}");
}

#[tokio::test]
async fn failed_renewals_do_not_affect_settlement() {
    let mut app = app();
    app.consume("on_task_created", slow).unwrap();
    let bus = InMemoryBus::new()
        .with_lock_duration(Duration::from_millis(60))
        .failing_renewals();
    let id = bus.add_message("task-created", SUB, r#"{"entity_id":"1"}"#);

    run_for(&app, &bus, Duration::from_millis(50)).await.unwrap();

    assert_eq!(bus.lock_renewals(&id), 0);
    assert_eq!(actions(&bus, "task-created"), vec!["complete"]);
}

// ============================================================================
// Receive retry
// ============================================================================

#[tokio::test]
async fn transient_receive_failures_are_retried() {
    init_test_tracing();
    let config = ConsumerConfig::new(SUB)
        .with_max_wait_time(Duration::from_millis(20))
        .with_receive_retry(
            RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(5))
                .build(),
        );
    let mut app = ConsumerApp::new(config);
    app.register_event_type::<TaskCreated>().unwrap();
    app.consume("on_task_created", on_task_created).unwrap();
    let bus = InMemoryBus::new()
        .failing_receives("task-created", SUB, 2)
        .with_message("task-created", SUB, r#"{"entity_id":"1"}"#);

    run_for(&app, &bus, Duration::from_millis(200)).await.unwrap();

    assert_eq!(actions(&bus, "task-created"), vec!["complete"]);
}

#[tokio::test]
async fn exhausted_receive_retries_stop_every_runner() {
    init_test_tracing();
    let config = ConsumerConfig::new(SUB)
        .with_max_wait_time(Duration::from_millis(20))
        .with_receive_retry(
            RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(1))
                .build(),
        );
    let mut app = ConsumerApp::new(config);
    app.register_event_type::<TaskCreated>().unwrap();
    app.register_event_type::<UserCreated>().unwrap();
    app.consume("on_task_created", on_task_created).unwrap();
    app.consume("on_user_created", on_user_created).unwrap();
    let bus = InMemoryBus::new().failing_receives("task-created", SUB, usize::MAX);

    let started = Instant::now();
    let result = run_for(&app, &bus, Duration::from_secs(5)).await;

    match result {
        Err(ConsumerError::ReceiveExhausted {
            topic, attempts, ..
        }) => {
            assert_eq!(topic, "task-created");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected ReceiveExhausted, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(bus.receivers_closed(), 2);
    assert_eq!(bus.connections_closed(), 1);
}

#[tokio::test]
async fn cancel_interrupts_a_receive_backoff() {
    init_test_tracing();
    let config = ConsumerConfig::new(SUB)
        .with_max_wait_time(Duration::from_millis(20))
        .with_receive_retry(
            RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_secs(2))
                .build(),
        );
    let mut app = ConsumerApp::new(config);
    app.register_event_type::<TaskCreated>().unwrap();
    app.consume("on_task_created", on_task_created).unwrap();
    let bus = InMemoryBus::new().failing_receives("task-created", SUB, usize::MAX);

    let started = Instant::now();
    assert_ok!(run_for(&app, &bus, Duration::from_millis(50)).await);

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(bus.receivers_closed(), 1);
    assert_eq!(bus.connections_closed(), 1);
}
