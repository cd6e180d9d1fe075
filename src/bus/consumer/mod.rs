//! Consumer runtime: subscribe a queue to a message handler.
//!
//! Deliveries for one subscription are handled one at a time, in delivery
//! order. Settling a delivery is the handler's job. The runtime only steps in
//! when the handler fails: it rejects with requeue so the broker can
//! redeliver. Handlers that need poison-message containment must catch their
//! own errors and reject without requeue.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::{BusError, ConnectionManager, Delivery, DeliveryStream, Result};

/// Handler for deliveries from a subscribed queue.
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. Acknowledge or reject it through `delivery`.
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(delivery))
    }
}

/// Subscription options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Let the broker settle deliveries on receipt. Off by default.
    pub auto_ack: bool,
}

/// A running subscription.
///
/// The consume loop survives reconnects and stops once the connection
/// manager is failed or shut down.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop consuming. Unsettled deliveries are reclaimed by the broker when
    /// the channel closes.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the consume loop to stop on its own.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(queue = %self.queue, error = %e, "Consumer task panicked");
            }
        }
    }
}

/// Subscribes queues over the manager's shared channel.
#[derive(Clone)]
pub struct ConsumerRuntime {
    manager: Arc<ConnectionManager>,
}

impl ConsumerRuntime {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Subscribe `handler` to `queue`.
    ///
    /// Acquiring the channel, declaring the queue and starting the consumer
    /// happen before this returns; their errors go to the caller. Deliveries
    /// are then processed on a background task.
    pub async fn subscribe<H>(
        &self,
        queue: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<Subscription>
    where
        H: MessageHandler + 'static,
    {
        let consumer_tag = format!("salesbus-{}", Uuid::new_v4());

        let stream = open_stream(&self.manager, queue, &consumer_tag, options)
            .await
            .inspect_err(|e| error!(queue = %queue, error = %e, "Failed to set up consumer"))?;

        Ok(self.start(queue, consumer_tag, handler, options, stream))
    }

    /// Like [`subscribe`](Self::subscribe), but waits out an unreachable
    /// broker while the manager reconnects.
    ///
    /// Only terminal errors (`Fatal`, `ShutDown`) are returned.
    pub async fn subscribe_when_ready<H>(
        &self,
        queue: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<Subscription>
    where
        H: MessageHandler + 'static,
    {
        let consumer_tag = format!("salesbus-{}", Uuid::new_v4());

        let stream = reopen_stream(&self.manager, queue, &consumer_tag, options)
            .await
            .inspect_err(|e| error!(queue = %queue, error = %e, "Failed to set up consumer"))?;

        Ok(self.start(queue, consumer_tag, handler, options, stream))
    }

    fn start<H>(
        &self,
        queue: &str,
        consumer_tag: String,
        handler: H,
        options: ConsumeOptions,
        stream: DeliveryStream,
    ) -> Subscription
    where
        H: MessageHandler + 'static,
    {
        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            auto_ack = options.auto_ack,
            "Consumer connected, processing messages"
        );

        let task = tokio::spawn(consume_loop(
            Arc::clone(&self.manager),
            queue.to_string(),
            consumer_tag.clone(),
            Arc::new(handler),
            options,
            stream,
        ));

        Subscription {
            queue: queue.to_string(),
            consumer_tag,
            task,
        }
    }
}

/// Acquire the channel, declare the queue, start consuming.
async fn open_stream(
    manager: &Arc<ConnectionManager>,
    queue: &str,
    consumer_tag: &str,
    options: ConsumeOptions,
) -> Result<DeliveryStream> {
    let channel = manager.acquire_channel().await?;

    let result = async {
        channel.declare_queue(queue).await?;
        channel.consume(queue, consumer_tag, options.auto_ack).await
    }
    .await;

    if let Err(e) = &result {
        if e.is_channel_fault() {
            manager.report_fault(&channel, &e.to_string());
        }
    }
    result
}

async fn consume_loop(
    manager: Arc<ConnectionManager>,
    queue: String,
    consumer_tag: String,
    handler: Arc<dyn MessageHandler>,
    options: ConsumeOptions,
    mut stream: DeliveryStream,
) {
    loop {
        while let Some(next) = stream.next().await {
            match next {
                Ok(delivery) => process_delivery(handler.as_ref(), delivery, options).await,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Consumer delivery error, will resubscribe");
                    break;
                }
            }
        }

        info!(queue = %queue, "Consumer stream ended, resubscribing...");

        stream = match reopen_stream(&manager, &queue, &consumer_tag, options).await {
            Ok(stream) => {
                info!(queue = %queue, "Consumer resubscribed");
                stream
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Stopping consumer");
                return;
            }
        };
    }
}

/// Open a stream, retrying until it succeeds or the manager gives up.
async fn reopen_stream(
    manager: &Arc<ConnectionManager>,
    queue: &str,
    consumer_tag: &str,
    options: ConsumeOptions,
) -> Result<DeliveryStream> {
    loop {
        match open_stream(manager, queue, consumer_tag, options).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_terminal() => return Err(e),
            // The manager already paces reconnection.
            Err(e) if e.is_connectivity() => {
                debug!(queue = %queue, error = %e, "Subscribe failed, waiting for reconnect");
            }
            Err(e) => {
                let delay = manager.policy().delay;
                warn!(
                    queue = %queue,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Subscribe failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn process_delivery(
    handler: &dyn MessageHandler,
    delivery: Delivery,
    options: ConsumeOptions,
) {
    let span = tracing::info_span!(
        "bus.consume",
        queue = %delivery.queue,
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered
    );

    let outcome = AssertUnwindSafe(handler.handle(delivery.clone()))
        .catch_unwind()
        .instrument(span)
        .await
        .unwrap_or_else(|_| Err(BusError::Handler("handler panicked".to_string())));

    match outcome {
        Ok(()) => {
            if !delivery.is_settled() {
                warn!(
                    queue = %delivery.queue,
                    delivery_tag = delivery.delivery_tag,
                    "Handler returned without settling delivery"
                );
            }
        }
        Err(e) => {
            error!(
                queue = %delivery.queue,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Error processing message"
            );
            if options.auto_ack || delivery.is_settled() {
                return;
            }
            if let Err(e) = delivery.reject(true).await {
                error!(
                    queue = %delivery.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Failed to requeue message"
                );
            }
        }
    }
}
