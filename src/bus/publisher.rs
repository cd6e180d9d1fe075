//! Publisher: durable sends over the manager's shared channel.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use super::{BusError, ConnectionManager, Result};

/// Per-publish options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to keep the message across its own restarts.
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { persistent: true }
    }
}

impl PublishOptions {
    pub fn transient() -> Self {
        Self { persistent: false }
    }
}

/// Sends messages to named queues.
///
/// Failures are returned unretried: the caller decides whether the publish
/// matters enough to retry or to fail the operation that produced it.
#[derive(Clone)]
pub struct Publisher {
    manager: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Publish `message` as UTF-8 JSON.
    pub async fn publish<T>(&self, queue: &str, message: &T, options: PublishOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload =
            serde_json::to_vec(message).map_err(|e| BusError::Serialization(e.to_string()))?;
        self.publish_bytes(queue, &payload, options).await
    }

    /// Publish an opaque payload.
    ///
    /// Waits for an in-flight reconnect, declares `queue` durable, then sends.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(queue = %queue))]
    pub async fn publish_bytes(
        &self,
        queue: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<()> {
        let channel = self.manager.acquire_channel().await.inspect_err(|e| {
            error!(error = %e, "Failed to publish message: no channel");
        })?;

        let result = async {
            channel.declare_queue(queue).await?;
            channel.publish(queue, payload, options.persistent).await
        }
        .await;

        match &result {
            Ok(()) => debug!(
                bytes = payload.len(),
                persistent = options.persistent,
                "Published message"
            ),
            Err(e) => {
                error!(error = %e, "Failed to publish message");
                if e.is_channel_fault() {
                    self.manager.report_fault(&channel, &e.to_string());
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ConnectionState, MockBroker, ReconnectPolicy};
    use serde_json::json;
    use std::time::Duration;

    fn publisher(broker: &MockBroker) -> (Publisher, Arc<ConnectionManager>) {
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            ReconnectPolicy::new(Duration::from_secs(5), 3),
        );
        (Publisher::new(Arc::clone(&manager)), manager)
    }

    #[tokio::test]
    async fn test_publish_declares_queue_and_persists() {
        let broker = MockBroker::new();
        let (publisher, _manager) = publisher(&broker);

        publisher
            .publish("sales_events", &json!({"type": "sale_added"}), PublishOptions::default())
            .await
            .unwrap();

        assert!(broker.is_declared("sales_events"));
        assert_eq!(
            broker.published("sales_events"),
            vec![br#"{"type":"sale_added"}"#.to_vec()]
        );
        assert_eq!(broker.published_persistence("sales_events"), vec![true]);
    }

    #[tokio::test]
    async fn test_publish_transient_option() {
        let broker = MockBroker::new();
        let (publisher, _manager) = publisher(&broker);

        publisher
            .publish_bytes("q", b"raw", PublishOptions::transient())
            .await
            .unwrap();

        assert_eq!(broker.published_persistence("q"), vec![false]);
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_retried() {
        let broker = MockBroker::new();
        broker.set_fail_on_publish(true);
        let (publisher, manager) = publisher(&broker);

        let result = publisher
            .publish_bytes("q", b"raw", PublishOptions::default())
            .await;

        assert!(matches!(result, Err(BusError::Publish(_))));
        assert!(broker.published("q").is_empty());
        // Not a channel fault: the connection stays up.
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_waits_for_reconnect() {
        let broker = MockBroker::new();
        let (publisher, manager) = publisher(&broker);
        publisher
            .publish_bytes("q", b"first", PublishOptions::default())
            .await
            .unwrap();

        broker.drop_connections("broker restart");
        let mut states = manager.watch_state();
        while *states.borrow_and_update() != ConnectionState::Reconnecting {
            states.changed().await.unwrap();
        }

        publisher
            .publish_bytes("q", b"second", PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.published("q"), vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let broker = MockBroker::new();
        let (publisher, manager) = publisher(&broker);
        manager.shutdown().await;

        let result = publisher
            .publish_bytes("q", b"late", PublishOptions::default())
            .await;

        assert!(matches!(result, Err(BusError::ShutDown)));
        assert_eq!(broker.connect_attempts(), 0);
    }
}
