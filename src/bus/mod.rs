//! Broker messaging for durable point-to-point event delivery.
//!
//! This module contains:
//! - `Broker` / `BrokerConnection` / `BrokerChannel` traits: the transport seam
//! - `Delivery`: a received message carrying a settle-once handle
//! - `ConnectionManager`: lifecycle of the single shared connection and channel
//! - `Publisher` and `ConsumerRuntime`: the two callers of that channel
//! - Implementations: AMQP (RabbitMQ), Mock

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod mock;
pub mod publisher;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use consumer::{ConsumeOptions, ConsumerRuntime, MessageHandler, Subscription};
pub use mock::MockBroker;
pub use publisher::{PublishOptions, Publisher};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
///
/// Cloneable so one failed connection attempt can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker unreachable after {attempts} reconnection attempts: {last_error}")]
    Fatal { attempts: u32, last_error: String },

    #[error("Channel error: {0}")]
    Protocol(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Delivery {0} was already acknowledged or rejected")]
    AlreadySettled(u64),

    #[error("Connection manager is shut down")]
    ShutDown,
}

impl BusError {
    /// The channel that produced this error can no longer be used.
    pub fn is_channel_fault(&self) -> bool {
        matches!(self, BusError::Protocol(_))
    }

    /// Errors that the connection manager recovers from on its own.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Protocol(_))
    }

    /// Errors after which no channel will ever be handed out again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BusError::Fatal { .. } | BusError::ShutDown)
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Factory for broker sessions.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MockBroker`: In-memory broker for testing
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new transport session.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live transport session.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical channel over this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Resolves with a reason once the connection, or a channel on it, has
    /// closed or failed.
    fn closed(&self) -> BoxFuture<'static, String>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}

/// A logical channel used for both publishing and consuming.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue. Redeclaring an existing queue is a no-op.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Send a payload to a queue.
    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<()>;

    /// Start consuming a queue.
    ///
    /// With `auto_ack` the broker considers each message settled on delivery.
    async fn consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool)
        -> Result<DeliveryStream>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

/// Broker-side settlement of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

// ============================================================================
// Delivery
// ============================================================================

struct DeliveryHandle {
    acker: Box<dyn Acknowledger>,
    settled: AtomicBool,
}

/// A message received from a queue.
///
/// Clones share one settlement handle: whichever clone acks or rejects first
/// wins, every later attempt fails with `BusError::AlreadySettled` without
/// reaching the broker.
#[derive(Clone)]
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    payload: Arc<[u8]>,
    handle: Arc<DeliveryHandle>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        payload: impl Into<Arc<[u8]>>,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self {
            queue: queue.into(),
            delivery_tag,
            redelivered,
            payload: payload.into(),
            handle: Arc::new(DeliveryHandle {
                acker: Box::new(acker),
                settled: AtomicBool::new(false),
            }),
        }
    }

    /// Mark the delivery as settled by the broker (auto-ack consumers).
    pub fn auto_acked(self) -> Self {
        self.handle.settled.store(true, Ordering::Release);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_settled(&self) -> bool {
        self.handle.settled.load(Ordering::Acquire)
    }

    /// Acknowledge the delivery.
    pub async fn ack(&self) -> Result<()> {
        self.claim()?;
        self.handle.acker.ack().await
    }

    /// Reject the delivery, optionally allowing the broker to redeliver it.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.claim()?;
        self.handle.acker.reject(requeue).await
    }

    fn claim(&self) -> Result<()> {
        if self.handle.settled.swap(true, Ordering::AcqRel) {
            return Err(BusError::AlreadySettled(self.delivery_tag));
        }
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}
