//! # pubsub-kit testing
//!
//! Testing utilities for pubsub-kit consumers.
//!
//! This crate provides:
//! - [`InMemoryBus`]: a scriptable bus that records settlements, lock
//!   renewals and receiver lifecycles
//! - [`run_for`]: run a [`ConsumerApp`](pubsub_kit_runtime::ConsumerApp)
//!   for a bounded time
//! - [`init_test_tracing`]: route `tracing` output through the test writer
//!
//! ## Example
//!
//! ```ignore
//! use pubsub_kit_testing::{InMemoryBus, run_for};
//!
//! #[tokio::test]
//! async fn completes_task_created() {
//!     let bus = InMemoryBus::new()
//!         .with_message("task-created", "TEST_SUB", r#"{"entity_id":"123"}"#);
//!     let mut app = consumer_app();
//!     app.consume("on_task_created", on_task_created).unwrap();
//!
//!     run_for(&app, &bus, Duration::from_millis(200)).await.unwrap();
//!
//!     assert_eq!(bus.settlements("task-created", "TEST_SUB").len(), 1);
//! }
//! ```

pub mod bus;
pub mod harness;

pub use bus::{InMemoryBus, SettlementRecord};
pub use harness::{init_test_tracing, run_filtered_for, run_for};
