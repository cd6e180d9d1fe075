//! Post-mutation notification for components that write sales data.
//!
//! After a successful write a producer publishes the event and evicts the
//! listing itself. Neither step may undo or block the write: failures are
//! logged and reported back, never raised.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::bus::{BusError, PublishOptions, Publisher};
use crate::cache::{Cache, CacheError};
use crate::events::{DomainEvent, SaleEventKind, SALES_EVENTS_QUEUE, SALES_LIST_KEY};

/// What happened to each half of a notification.
#[derive(Debug)]
pub struct NotifyOutcome {
    pub publish: Result<(), BusError>,
    pub evict: Result<(), CacheError>,
}

impl NotifyOutcome {
    /// Both the event and the local eviction went through.
    pub fn is_complete(&self) -> bool {
        self.publish.is_ok() && self.evict.is_ok()
    }
}

/// Publishes sales events and evicts the listing locally.
#[derive(Clone)]
pub struct MutationNotifier {
    publisher: Publisher,
    cache: Cache,
}

impl MutationNotifier {
    pub fn new(publisher: Publisher, cache: Cache) -> Self {
        Self { publisher, cache }
    }

    /// Notify with an event of `kind` carrying `fields`.
    pub async fn notify(&self, kind: SaleEventKind, fields: Map<String, Value>) -> NotifyOutcome {
        let event = DomainEvent {
            event_type: kind.as_str().to_string(),
            fields,
        };
        self.notify_event(&event).await
    }

    /// Publish `event` to the sales queue, then evict the listing.
    pub async fn notify_event(&self, event: &DomainEvent) -> NotifyOutcome {
        let publish = self
            .publisher
            .publish(SALES_EVENTS_QUEUE, event, PublishOptions::default())
            .await;
        if let Err(e) = &publish {
            warn!(
                event_type = %event.event_type,
                error = %e,
                "Failed to publish sales event; relying on local eviction"
            );
        }

        let evict = self.cache.delete(SALES_LIST_KEY).await;
        if let Err(e) = &evict {
            warn!(
                key = SALES_LIST_KEY,
                error = %e,
                "Failed to evict sales list; listing may be stale until TTL"
            );
        }

        debug!(event_type = %event.event_type, "Sales mutation notified");
        NotifyOutcome { publish, evict }
    }
}
