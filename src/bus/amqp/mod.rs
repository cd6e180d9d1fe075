//! AMQP (RabbitMQ) transport.
//!
//! Queues are declared durable and messages are sent through the default
//! exchange with the queue name as routing key.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BusError, Delivery, DeliveryStream,
    Result,
};

/// Delivery mode marking a message persistent.
const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ broker reached through a single AMQP URL.
#[derive(Clone, Debug)]
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    /// Create a broker for `url` (e.g., amqp://localhost:5672).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let closed = ClosedSignal::new();
        let signal = closed.clone();
        connection.on_error(move |e| {
            warn!(error = %e, "AMQP connection error");
            signal.fire(format!("connection error: {}", e));
        });

        info!(url = %self.url, "Connected to RabbitMQ");

        Ok(Arc::new(AmqpConnection { connection, closed }))
    }
}

/// First close reason reported by lapin for a connection or its channels.
#[derive(Clone)]
struct ClosedSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl ClosedSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record `reason` unless an earlier one is already set.
    fn fire(&self, reason: String) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    fn wait(&self) -> BoxFuture<'static, String> {
        let mut rx = self.tx.subscribe();
        async move {
            let reason = rx
                .wait_for(Option::is_some)
                .await
                .map(|reason| reason.clone().unwrap_or_default());
            reason.unwrap_or_else(|_| "connection dropped".to_string())
        }
        .boxed()
    }
}

struct AmqpConnection {
    connection: Connection,
    closed: ClosedSignal,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        let signal = self.closed.clone();
        let channel_id = channel.id();
        channel.on_error(move |e| {
            warn!(channel_id, error = %e, "AMQP channel error");
            signal.fire(format!("channel error: {}", e));
        });

        debug!(channel_id, "Opened AMQP channel");

        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn closed(&self) -> BoxFuture<'static, String> {
        self.closed.wait()
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Protocol(format!("Failed to declare queue '{}': {}", queue, e)))?;

        debug!(queue = %queue, "Declared durable queue");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if persistent { PERSISTENT } else { TRANSIENT });

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Protocol(format!("Failed to publish to '{}': {}", queue, e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish to '{}' not confirmed: {}", queue, e)))?;

        debug!(queue = %queue, bytes = payload.len(), persistent, "Published message");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Protocol(format!("Failed to start consumer on '{}': {}", queue, e))
            })?;

        info!(queue = %queue, consumer_tag = %consumer_tag, auto_ack, "Started consumer");

        let queue = queue.to_string();
        let stream = consumer.map(move |item| -> Result<Delivery> {
            let delivery = item
                .map_err(|e| BusError::Protocol(format!("Consumer on '{}' failed: {}", queue, e)))?;
            let delivery = Delivery::new(
                queue.as_str(),
                delivery.delivery_tag,
                delivery.redelivered,
                delivery.data,
                AmqpAcker {
                    acker: delivery.acker,
                },
            );
            Ok(if auto_ack {
                delivery.auto_acked()
            } else {
                delivery
            })
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BusError::Protocol(format!("Failed to close channel: {}", e)))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Protocol(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BusError::Protocol(format!("Failed to reject: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_closed_signal_keeps_first_reason() {
        let signal = ClosedSignal::new();
        let waiter = signal.wait();

        signal.fire("channel error: PRECONDITION_FAILED".to_string());
        signal.fire("connection error: reset".to_string());

        assert_eq!(waiter.await, "channel error: PRECONDITION_FAILED");
        assert_eq!(signal.wait().await, "channel error: PRECONDITION_FAILED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_signal_pending_until_fired() {
        let signal = ClosedSignal::new();
        let waiter = signal.wait();

        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let broker = AmqpBroker::new("amqp://127.0.0.1:1");
        let result = broker.connect().await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test amqp -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::bus::{
        ConnectionManager, ConsumeOptions, ConsumerRuntime, PublishOptions, Publisher,
        ReconnectPolicy,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    fn test_queue() -> String {
        format!("salesbus-test-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_publish_and_consume_round_trip() {
        let manager = ConnectionManager::new(
            Arc::new(AmqpBroker::new(amqp_url())),
            ReconnectPolicy::new(Duration::from_millis(200), 3),
        );
        let publisher = Publisher::new(manager.clone());
        let runtime = ConsumerRuntime::new(manager.clone());
        let queue = test_queue();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = runtime
            .subscribe(
                &queue,
                move |delivery: Delivery| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(delivery.payload().to_vec());
                        delivery.ack().await
                    }
                },
                ConsumeOptions::default(),
            )
            .await
            .expect("Failed to subscribe");

        publisher
            .publish_bytes(&queue, b"{\"type\":\"sale_added\"}", PublishOptions::default())
            .await
            .expect("Failed to publish");

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for delivery")
            .expect("Handler dropped");
        assert_eq!(received, b"{\"type\":\"sale_added\"}");

        subscription.abort();
        manager.shutdown().await;
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_rejected_message_is_redelivered() {
        let manager = ConnectionManager::new(
            Arc::new(AmqpBroker::new(amqp_url())),
            ReconnectPolicy::default(),
        );
        let publisher = Publisher::new(manager.clone());
        let runtime = ConsumerRuntime::new(manager.clone());
        let queue = test_queue();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = runtime
            .subscribe(
                &queue,
                move |delivery: Delivery| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(delivery.redelivered);
                        if delivery.redelivered {
                            delivery.ack().await
                        } else {
                            Err(BusError::Handler("first attempt fails".to_string()))
                        }
                    }
                },
                ConsumeOptions::default(),
            )
            .await
            .expect("Failed to subscribe");

        publisher
            .publish_bytes(&queue, b"{}", PublishOptions::default())
            .await
            .expect("Failed to publish");

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(first, Some(false));
        assert_eq!(second, Some(true));

        subscription.abort();
        manager.shutdown().await;
    }
}
