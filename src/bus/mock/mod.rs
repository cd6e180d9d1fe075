//! In-memory broker for testing.
//!
//! Models the subset of broker behavior the connection manager and consumer
//! runtime rely on: durable queues, one consumer per queue, explicit
//! ack/reject with requeue, redelivery of unacknowledged messages when a
//! connection drops, and failure injection for connects and publishes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use tokio::sync::watch;

use super::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BusError, Delivery, DeliveryStream,
    Result,
};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected { requeue: bool },
}

/// A settled delivery, as recorded by the mock broker.
#[derive(Debug, Clone)]
pub struct SettledDelivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub outcome: Settlement,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Arc<[u8]>,
    persistent: bool,
    redelivered: bool,
}

struct ConsumerSlot {
    connection_id: u64,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Unacked {
    connection_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct MockQueue {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumer: Option<ConsumerSlot>,
    published: Vec<StoredMessage>,
}

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    failing_connects: usize,
    connect_delay: Duration,
    close_delay: Duration,
    fail_on_publish: bool,
    next_connection_id: u64,
    next_delivery_tag: u64,
    open_connections: HashMap<u64, watch::Sender<Option<String>>>,
    queues: HashMap<String, MockQueue>,
    settlements: Vec<SettledDelivery>,
}

struct BrokerShared {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicUsize,
    channel_closes: AtomicUsize,
    connection_closes: AtomicUsize,
    settled_tx: watch::Sender<usize>,
}

/// Mock broker. Clones share state.
#[derive(Clone)]
pub struct MockBroker {
    shared: Arc<BrokerShared>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (settled_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(BrokerShared {
                state: Mutex::new(BrokerState::default()),
                connect_attempts: AtomicUsize::new(0),
                channel_closes: AtomicUsize::new(0),
                connection_closes: AtomicUsize::new(0),
                settled_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    /// Refuse every connection attempt while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// Make every connection attempt take `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// Delay closing connections by `delay`.
    pub fn set_close_delay(&self, delay: Duration) {
        self.lock().close_delay = delay;
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.lock().fail_on_publish = fail;
    }

    /// Drop every open connection as if the broker went away.
    ///
    /// Consumers are cancelled and their unacknowledged deliveries go back to
    /// the front of the queue, flagged as redelivered.
    pub fn drop_connections(&self, reason: &str) {
        let ids: Vec<u64> = self.lock().open_connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, reason);
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections.len()
    }

    pub fn channel_closes(&self) -> usize {
        self.shared.channel_closes.load(Ordering::SeqCst)
    }

    pub fn connection_closes(&self) -> usize {
        self.shared.connection_closes.load(Ordering::SeqCst)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Payloads published to `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.published.iter().map(|m| m.payload.to_vec()).collect())
            .unwrap_or_default()
    }

    /// Persistence flags of messages published to `queue`, in publish order.
    pub fn published_persistence(&self, queue: &str) -> Vec<bool> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.published.iter().map(|m| m.persistent).collect())
            .unwrap_or_default()
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn settlements(&self) -> Vec<SettledDelivery> {
        self.lock().settlements.clone()
    }

    /// Wait until at least `count` deliveries have been settled.
    pub async fn wait_for_settlements(&self, count: usize) {
        let mut rx = self.shared.settled_tx.subscribe();
        while *rx.borrow_and_update() < count {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Broker internals
    // ------------------------------------------------------------------

    fn connection_open(&self, connection_id: u64) -> bool {
        self.lock().open_connections.contains_key(&connection_id)
    }

    fn close_connection(&self, connection_id: u64, reason: &str) {
        let mut state = self.lock();
        if let Some(closed_tx) = state.open_connections.remove(&connection_id) {
            closed_tx.send_replace(Some(reason.to_string()));
        }
        release_consumers(&mut state, connection_id);
        let queues: Vec<String> = state.queues.keys().cloned().collect();
        for queue in queues {
            self.dispatch(&mut state, &queue);
        }
    }

    /// Hand ready messages to the queue's consumer.
    fn dispatch(&self, state: &mut BrokerState, queue_name: &str) {
        loop {
            let tag = state.next_delivery_tag + 1;
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            let Some(consumer) = &queue.consumer else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            let acker = MockAcker {
                broker: self.clone(),
                queue: queue_name.to_string(),
                delivery_tag: tag,
            };
            let mut delivery = Delivery::new(
                queue_name,
                tag,
                message.redelivered,
                Arc::clone(&message.payload),
                acker,
            );
            if consumer.auto_ack {
                delivery = delivery.auto_acked();
            }

            if consumer.tx.unbounded_send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                queue.consumer = None;
                return;
            }

            if !consumer.auto_ack {
                queue.unacked.insert(
                    tag,
                    Unacked {
                        connection_id: consumer.connection_id,
                        message,
                    },
                );
            }
            state.next_delivery_tag = tag;
        }
    }

    fn settle(&self, queue_name: &str, delivery_tag: u64, outcome: Settlement) -> Result<()> {
        let mut state = self.lock();
        let unacked = state
            .queues
            .get_mut(queue_name)
            .and_then(|q| q.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                BusError::Protocol(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                ))
            })?;

        state.settlements.push(SettledDelivery {
            queue: queue_name.to_string(),
            delivery_tag,
            payload: unacked.message.payload.to_vec(),
            redelivered: unacked.message.redelivered,
            outcome,
        });
        let settled = state.settlements.len();

        if outcome == (Settlement::Rejected { requeue: true }) {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.ready.push_front(StoredMessage {
                    redelivered: true,
                    ..unacked.message
                });
            }
            self.dispatch(&mut state, queue_name);
        }
        drop(state);

        self.shared.settled_tx.send_replace(settled);
        Ok(())
    }
}

/// Cancel consumers of a connection and requeue what they had not settled.
fn release_consumers(state: &mut BrokerState, connection_id: u64) {
    for queue in state.queues.values_mut() {
        if queue
            .consumer
            .as_ref()
            .is_some_and(|c| c.connection_id == connection_id)
        {
            queue.consumer = None;
        }

        let mut tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, u)| u.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                queue.ready.push_front(StoredMessage {
                    redelivered: true,
                    ..unacked.message
                });
            }
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.unavailable {
            return Err(BusError::Connection("ECONNREFUSED (mock)".to_string()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BusError::Connection("ECONNREFUSED (mock)".to_string()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (closed_tx, closed_rx) = watch::channel(None);
        state.open_connections.insert(id, closed_tx);

        Ok(Arc::new(MockConnection {
            broker: self.clone(),
            id,
            closed_rx,
        }))
    }
}

struct MockConnection {
    broker: MockBroker,
    id: u64,
    closed_rx: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.broker.connection_open(self.id) {
            return Err(BusError::Connection("connection is closed".to_string()));
        }
        Ok(Arc::new(MockChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            closed: AtomicBool::new(false),
        }))
    }

    fn closed(&self) -> BoxFuture<'static, String> {
        let mut rx = self.closed_rx.clone();
        async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(reason) = current {
                    return reason;
                }
                if rx.changed().await.is_err() {
                    let last = rx.borrow().clone();
                    return last.unwrap_or_else(|| "connection dropped".to_string());
                }
            }
        }
        .boxed()
    }

    async fn close(&self) -> Result<()> {
        let delay = self.broker.lock().close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.broker
            .shared
            .connection_closes
            .fetch_add(1, Ordering::SeqCst);
        self.broker.close_connection(self.id, "closed by client");
        Ok(())
    }
}

struct MockChannel {
    broker: MockBroker,
    connection_id: u64,
    closed: AtomicBool,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !self.broker.connection_open(self.connection_id) {
            return Err(BusError::Protocol("channel is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<()> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        if state.fail_on_publish {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }

        let message = StoredMessage {
            payload: Arc::from(payload),
            persistent,
            redelivered: false,
        };
        let target = state.queues.get_mut(queue).ok_or_else(|| {
            BusError::Protocol(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        target.published.push(message.clone());
        target.ready.push_back(message);

        self.broker.dispatch(&mut state, queue);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded();
        let mut state = self.broker.lock();
        let target = state.queues.get_mut(queue).ok_or_else(|| {
            BusError::Protocol(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        if target.consumer.is_some() {
            return Err(BusError::Subscribe(format!(
                "queue '{}' already has a consumer",
                queue
            )));
        }
        target.consumer = Some(ConsumerSlot {
            connection_id: self.connection_id,
            auto_ack,
            tx,
        });

        self.broker.dispatch(&mut state, queue);
        Ok(rx.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.broker
            .shared
            .channel_closes
            .fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.broker.lock();
            release_consumers(&mut state, self.connection_id);
        }
        Ok(())
    }
}

struct MockAcker {
    broker: MockBroker,
    queue: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<()> {
        self.broker
            .settle(&self.queue, self.delivery_tag, Settlement::Acked)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.broker
            .settle(&self.queue, self.delivery_tag, Settlement::Rejected { requeue })
    }
}

/// Acknowledger that only records what it was asked to do.
///
/// For exercising handlers without a broker.
#[derive(Clone, Default)]
pub struct RecordingAcker {
    calls: Arc<Mutex<Vec<Settlement>>>,
}

impl RecordingAcker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn acks(&self) -> usize {
        self.settlements()
            .iter()
            .filter(|s| **s == Settlement::Acked)
            .count()
    }

    /// `requeue` flag of each rejection, in order.
    pub fn rejections(&self) -> Vec<bool> {
        self.settlements()
            .iter()
            .filter_map(|s| match s {
                Settlement::Rejected { requeue } => Some(*requeue),
                Settlement::Acked => None,
            })
            .collect()
    }

    fn record(&self, settlement: Settlement) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(settlement);
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self) -> Result<()> {
        self.record(Settlement::Acked);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.record(Settlement::Rejected { requeue });
        Ok(())
    }
}
