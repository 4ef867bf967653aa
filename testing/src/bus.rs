//! Scriptable in-memory message bus.
//!
//! [`InMemoryBus`] implements the bus traits over per-subscription queues and
//! records every call the consumer engine makes, so tests can assert on
//! settlements, lock renewals and receiver lifecycles.
//!
//! - Messages are seeded with [`InMemoryBus::with_message`] or added while a
//!   consumer runs with [`InMemoryBus::add_message`].
//! - An empty receive polls the queue until `max_wait` elapses.
//! - Abandoned messages are dropped unless [`InMemoryBus::with_redelivery`]
//!   is set.
//! - Failures can be injected for connect, receiver, receive, renewal and
//!   settlement calls.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use chrono::{DateTime, Utc};
use pubsub_kit_core::bus::{BusConnection, BusFuture, MessageBus, ReceivedMessage, Receiver};
use pubsub_kit_core::error::BusError;
use pubsub_kit_core::outcome::Settlement;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Pair = (String, String);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn pair(topic: &str, subscription: &str) -> Pair {
    (topic.to_string(), subscription.to_string())
}

/// A settlement call observed by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    /// Topic name
    pub topic: String,
    /// Subscription name
    pub subscription: String,
    /// Message id
    pub message_id: String,
    /// What was applied
    pub settlement: Settlement,
}

#[derive(Debug)]
struct BusState {
    subscriptions: HashMap<String, Vec<String>>,
    queues: HashMap<Pair, VecDeque<ReceivedMessage>>,
    in_flight: HashMap<String, Pair>,
    settlements: Vec<SettlementRecord>,
    renewals: HashMap<String, u32>,
    receivers_opened: Vec<Pair>,
    receivers_closed: usize,
    connections_opened: usize,
    connections_closed: usize,
    published: Vec<(String, Vec<u8>)>,
    next_id: u64,
    lock_duration: Duration,
    redeliver: bool,
    fail_connect: Option<String>,
    fail_receivers: HashSet<Pair>,
    fail_receives: HashMap<Pair, usize>,
    fail_renewals: bool,
    fail_settlements: bool,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            subscriptions: HashMap::new(),
            queues: HashMap::new(),
            in_flight: HashMap::new(),
            settlements: Vec::new(),
            renewals: HashMap::new(),
            receivers_opened: Vec::new(),
            receivers_closed: 0,
            connections_opened: 0,
            connections_closed: 0,
            published: Vec::new(),
            next_id: 0,
            lock_duration: Duration::from_secs(30),
            redeliver: false,
            fail_connect: None,
            fail_receivers: HashSet::new(),
            fail_receives: HashMap::new(),
            fail_renewals: false,
            fail_settlements: false,
        }
    }
}

impl BusState {
    fn lock_expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.lock_duration).unwrap_or(chrono::Duration::MAX)
    }

    fn enqueue(&mut self, topic: &str, subscription: &str, body: Vec<u8>) -> String {
        self.next_id += 1;
        let message_id = format!("msg-{}", self.next_id);
        let message = ReceivedMessage::new(message_id.clone(), body, self.lock_expiry());
        self.queues
            .entry(pair(topic, subscription))
            .or_default()
            .push_back(message);
        message_id
    }
}

/// In-memory implementation of [`MessageBus`] for tests.
///
/// # Example
///
/// ```
/// use pubsub_kit_testing::InMemoryBus;
///
/// let bus = InMemoryBus::new()
///     .with_message("task-created", "TEST_SUB", r#"{"entity_id":"123"}"#);
/// assert_eq!(bus.pending("task-created", "TEST_SUB"), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap()
    }

    /// Seed a message on a subscription.
    #[must_use]
    pub fn with_message(self, topic: &str, subscription: &str, body: impl Into<Vec<u8>>) -> Self {
        self.add_message(topic, subscription, body);
        self
    }

    /// Seed several messages on a subscription.
    #[must_use]
    pub fn with_messages<I, B>(self, topic: &str, subscription: &str, bodies: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        for body in bodies {
            self.add_message(topic, subscription, body);
        }
        self
    }

    /// Declare a subscription so messages sent to its topic reach it.
    #[must_use]
    pub fn with_subscription(self, topic: &str, subscription: &str) -> Self {
        self.state()
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(subscription.to_string());
        self
    }

    /// Set how long a receive lock lasts (default 30 s).
    #[must_use]
    pub fn with_lock_duration(self, lock_duration: Duration) -> Self {
        self.state().lock_duration = lock_duration;
        self
    }

    /// Requeue abandoned messages with an incremented delivery count.
    #[must_use]
    pub fn with_redelivery(self) -> Self {
        self.state().redeliver = true;
        self
    }

    /// Make `connect` fail.
    #[must_use]
    pub fn failing_connect(self, reason: impl Into<String>) -> Self {
        self.state().fail_connect = Some(reason.into());
        self
    }

    /// Make opening a receiver for the pair fail.
    #[must_use]
    pub fn failing_receiver(self, topic: &str, subscription: &str) -> Self {
        self.state().fail_receivers.insert(pair(topic, subscription));
        self
    }

    /// Make the next `count` receive calls for the pair fail.
    #[must_use]
    pub fn failing_receives(self, topic: &str, subscription: &str, count: usize) -> Self {
        self.state()
            .fail_receives
            .insert(pair(topic, subscription), count);
        self
    }

    /// Make every lock renewal fail.
    #[must_use]
    pub fn failing_renewals(self) -> Self {
        self.state().fail_renewals = true;
        self
    }

    /// Make every settlement call fail (calls are still recorded).
    #[must_use]
    pub fn failing_settlements(self) -> Self {
        self.state().fail_settlements = true;
        self
    }

    /// Add a message while a consumer may be running. Returns its id.
    pub fn add_message(&self, topic: &str, subscription: &str, body: impl Into<Vec<u8>>) -> String {
        self.state().enqueue(topic, subscription, body.into())
    }

    /// Messages still queued for a subscription.
    #[must_use]
    pub fn pending(&self, topic: &str, subscription: &str) -> usize {
        self.state()
            .queues
            .get(&pair(topic, subscription))
            .map_or(0, VecDeque::len)
    }

    /// Settlement calls made for a subscription, in call order.
    #[must_use]
    pub fn settlements(&self, topic: &str, subscription: &str) -> Vec<SettlementRecord> {
        self.state()
            .settlements
            .iter()
            .filter(|r| r.topic == topic && r.subscription == subscription)
            .cloned()
            .collect()
    }

    /// Every settlement call, in call order.
    #[must_use]
    pub fn all_settlements(&self) -> Vec<SettlementRecord> {
        self.state().settlements.clone()
    }

    /// Successful lock renewals for a message.
    #[must_use]
    pub fn lock_renewals(&self, message_id: &str) -> u32 {
        self.state().renewals.get(message_id).copied().unwrap_or(0)
    }

    /// Pairs receivers were opened for, in order.
    #[must_use]
    pub fn receivers_opened(&self) -> Vec<Pair> {
        self.state().receivers_opened.clone()
    }

    /// Number of receivers closed.
    #[must_use]
    pub fn receivers_closed(&self) -> usize {
        self.state().receivers_closed
    }

    /// Number of connections opened.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    /// Number of connections closed.
    #[must_use]
    pub fn connections_closed(&self) -> usize {
        self.state().connections_closed
    }

    /// Bodies sent to a topic, in order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

impl MessageBus for InMemoryBus {
    fn connect(&self) -> BusFuture<'_, Arc<dyn BusConnection>> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(reason) = &state.fail_connect {
                return Err(BusError::ConnectionFailed(reason.clone()));
            }
            state.connections_opened += 1;
            drop(state);
            Ok(Arc::new(InMemoryConnection {
                state: Arc::clone(&self.state),
            }) as Arc<dyn BusConnection>)
        })
    }
}

struct InMemoryConnection {
    state: Arc<Mutex<BusState>>,
}

impl BusConnection for InMemoryConnection {
    fn receiver<'a>(
        &'a self,
        topic: &'a str,
        subscription: &'a str,
    ) -> BusFuture<'a, Arc<dyn Receiver>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let key = pair(topic, subscription);
            if state.fail_receivers.contains(&key) {
                return Err(BusError::ReceiverFailed {
                    topic: topic.to_string(),
                    subscription: subscription.to_string(),
                    reason: "injected receiver failure".to_string(),
                });
            }
            state.receivers_opened.push(key);
            drop(state);
            Ok(Arc::new(InMemoryReceiver {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
                state: Arc::clone(&self.state),
            }) as Arc<dyn Receiver>)
        })
    }

    fn send<'a>(&'a self, topic: &'a str, body: Vec<u8>) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let subscriptions = state.subscriptions.get(topic).cloned().unwrap_or_default();
            for subscription in &subscriptions {
                state.enqueue(topic, subscription, body.clone());
            }
            state.published.push((topic.to_string(), body));
            Ok(())
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().unwrap().connections_closed += 1;
            Ok(())
        })
    }
}

struct InMemoryReceiver {
    topic: String,
    subscription: String,
    state: Arc<Mutex<BusState>>,
}

impl InMemoryReceiver {
    fn key(&self) -> Pair {
        pair(&self.topic, &self.subscription)
    }

    fn try_receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, BusError> {
        let mut state = self.state.lock().unwrap();
        let key = self.key();

        if let Some(remaining) = state.fail_receives.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::ReceiveFailed("injected receive failure".to_string()));
            }
        }

        let lock_expiry = state.lock_expiry();
        let mut batch = Vec::new();
        if let Some(queue) = state.queues.get_mut(&key) {
            while batch.len() < max_messages {
                let Some(mut message) = queue.pop_front() else {
                    break;
                };
                message.locked_until = lock_expiry;
                batch.push(message);
            }
        }
        for message in &batch {
            state.in_flight.insert(message.message_id.clone(), key.clone());
        }
        Ok(batch)
    }

    fn settle(&self, message: &ReceivedMessage, settlement: Settlement) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        let action = settlement.action();
        state.settlements.push(SettlementRecord {
            topic: self.topic.clone(),
            subscription: self.subscription.clone(),
            message_id: message.message_id.clone(),
            settlement: settlement.clone(),
        });

        if state.fail_settlements {
            return Err(BusError::SettlementFailed {
                message_id: message.message_id.clone(),
                action,
                reason: "injected settlement failure".to_string(),
            });
        }
        if state.in_flight.remove(&message.message_id).is_none() {
            return Err(BusError::SettlementFailed {
                message_id: message.message_id.clone(),
                action,
                reason: "message is not locked by this receiver".to_string(),
            });
        }

        if settlement == Settlement::Abandon && state.redeliver {
            let redelivered = message.clone().with_delivery_count(message.delivery_count + 1);
            state
                .queues
                .entry(self.key())
                .or_default()
                .push_back(redelivered);
        }
        Ok(())
    }
}

impl Receiver for InMemoryReceiver {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscription(&self) -> &str {
        &self.subscription
    }

    fn receive_batch(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> BusFuture<'_, Vec<ReceivedMessage>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + max_wait;
            loop {
                let batch = self.try_receive(max_messages)?;
                if !batch.is_empty() || tokio::time::Instant::now() >= deadline {
                    return Ok(batch);
                }
                tokio::time::sleep(POLL_INTERVAL.min(max_wait)).await;
            }
        })
    }

    fn complete<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, ()> {
        Box::pin(async move { self.settle(message, Settlement::Complete) })
    }

    fn abandon<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, ()> {
        Box::pin(async move { self.settle(message, Settlement::Abandon) })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        reason: &'a str,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            self.settle(
                message,
                Settlement::DeadLetter {
                    reason: reason.to_string(),
                },
            )
        })
    }

    fn renew_lock<'a>(&'a self, message: &'a ReceivedMessage) -> BusFuture<'a, DateTime<Utc>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_renewals {
                return Err(BusError::LockRenewalFailed {
                    message_id: message.message_id.clone(),
                    reason: "injected renewal failure".to_string(),
                });
            }
            if !state.in_flight.contains_key(&message.message_id) {
                return Err(BusError::LockRenewalFailed {
                    message_id: message.message_id.clone(),
                    reason: "message is not locked by this receiver".to_string(),
                });
            }
            *state.renewals.entry(message.message_id.clone()).or_default() += 1;
            Ok(state.lock_expiry())
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().unwrap().receivers_closed += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_and_settle_are_recorded() {
        let bus = InMemoryBus::new().with_messages("orders", "billing", ["{}", "{}", "{}"]);
        let connection = bus.connect().await.unwrap();
        let receiver = connection.receiver("orders", "billing").await.unwrap();

        let batch = receiver.receive_batch(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(bus.pending("orders", "billing"), 1);

        receiver.complete(&batch[0]).await.unwrap();
        receiver.dead_letter(&batch[1], "bad").await.unwrap();
        assert!(receiver.complete(&batch[0]).await.is_err());

        let actions: Vec<_> = bus
            .settlements("orders", "billing")
            .into_iter()
            .map(|r| r.settlement.action())
            .collect();
        assert_eq!(actions, vec!["complete", "dead_letter", "complete"]);
    }

    #[tokio::test]
    async fn empty_receive_waits_then_returns_nothing() {
        let bus = InMemoryBus::new();
        let connection = bus.connect().await.unwrap();
        let receiver = connection.receiver("orders", "billing").await.unwrap();

        let started = tokio::time::Instant::now();
        let batch = receiver.receive_batch(10, Duration::from_millis(30)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn send_fans_out_to_declared_subscriptions() {
        let bus = InMemoryBus::new()
            .with_subscription("orders", "billing")
            .with_subscription("orders", "shipping");
        let connection = bus.connect().await.unwrap();
        connection.send("orders", b"{}".to_vec()).await.unwrap();

        assert_eq!(bus.pending("orders", "billing"), 1);
        assert_eq!(bus.pending("orders", "shipping"), 1);
        assert_eq!(bus.published("orders"), vec![b"{}".to_vec()]);
    }

    #[tokio::test]
    async fn abandoned_messages_are_redelivered_when_enabled() {
        let bus = InMemoryBus::new()
            .with_redelivery()
            .with_message("orders", "billing", "{}");
        let connection = bus.connect().await.unwrap();
        let receiver = connection.receiver("orders", "billing").await.unwrap();

        let batch = receiver.receive_batch(1, Duration::from_millis(10)).await.unwrap();
        receiver.abandon(&batch[0]).await.unwrap();

        let again = receiver.receive_batch(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again[0].message_id, batch[0].message_id);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn injected_failures() {
        let bus = InMemoryBus::new()
            .failing_receives("orders", "billing", 1)
            .failing_receiver("orders", "audit");
        let connection = bus.connect().await.unwrap();
        assert!(connection.receiver("orders", "audit").await.is_err());

        let receiver = connection.receiver("orders", "billing").await.unwrap();
        assert!(receiver.receive_batch(1, Duration::from_millis(5)).await.is_err());
        assert!(receiver.receive_batch(1, Duration::from_millis(5)).await.is_ok());

        let failing = InMemoryBus::new().failing_connect("unreachable");
        assert!(matches!(
            failing.connect().await,
            Err(BusError::ConnectionFailed(_))
        ));
    }
}
