//! Cache invalidation driven by sales events.
//!
//! Secondary to the eviction producers do after a write: if a producer
//! crashes between its mutation and its own eviction, this subscriber still
//! clears the listing once the event is consumed.
//!
//! Policy per delivery:
//! - invalid JSON: reject without requeue
//! - recognized event: evict the listing key, then ack
//! - any other JSON (no `type`, unknown type): ack, nothing to evict
//! - eviction failure: reject without requeue; the listing expires by TTL
//!
//! Nothing is ever requeued, so an unreachable cache cannot turn a delivery
//! into a redelivery loop.

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::bus::{ConsumeOptions, ConsumerRuntime, Delivery, MessageHandler, Result, Subscription};
use crate::cache::Cache;
use crate::events::{event_kind, SALES_EVENTS_QUEUE, SALES_LIST_KEY};

/// Evicts the sales listing for every recognized sales event.
#[derive(Clone)]
pub struct InvalidationHandler {
    cache: Cache,
    key: String,
}

impl InvalidationHandler {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            key: SALES_LIST_KEY.to_string(),
        }
    }
}

impl MessageHandler for InvalidationHandler {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Result<()>> {
        let cache = self.cache.clone();
        let key = self.key.clone();

        Box::pin(async move {
            let kind = match event_kind(delivery.payload()) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(
                        delivery_tag = delivery.delivery_tag,
                        error = %e,
                        "Discarding malformed domain event"
                    );
                    return delivery.reject(false).await;
                }
            };

            let Some(kind) = kind else {
                debug!(delivery_tag = delivery.delivery_tag, "Ignoring unrecognized event type");
                return delivery.ack().await;
            };

            if let Err(e) = cache.delete(&key).await {
                error!(
                    event_type = kind.as_str(),
                    key = %key,
                    error = %e,
                    "Failed to evict sales list, discarding event"
                );
                return delivery.reject(false).await;
            }

            debug!(event_type = kind.as_str(), key = %key, "Invalidated sales list cache");
            delivery.ack().await
        })
    }
}

/// Subscribe the invalidation handler to the sales events queue.
pub async fn subscribe_cache_invalidation(
    runtime: &ConsumerRuntime,
    cache: Cache,
) -> Result<Subscription> {
    runtime
        .subscribe(
            SALES_EVENTS_QUEUE,
            InvalidationHandler::new(cache),
            ConsumeOptions::default(),
        )
        .await
}
