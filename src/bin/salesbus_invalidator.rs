//! salesbus-invalidator: Sales list cache invalidation service
//!
//! Consumes the sales events queue and evicts the cached sales listing for
//! every sale that is added, updated or deleted.
//!
//! ## Architecture
//! ```text
//! [producers] --(sales_events)--> [salesbus-invalidator] --(DEL sales:list)--> [Redis]
//! ```
//!
//! ## Configuration
//! - SALESBUS_CONFIG: Path to YAML config (default: config.yaml)
//! - RABBITMQ_URL, RECONNECT_DELAY_MS, MAX_RECONNECT_ATTEMPTS: Broker overrides
//! - REDIS_HOST, REDIS_PORT, CACHE_TTL_SECS: Cache overrides
//! - SALESBUS_LOG: Tracing filter (default: info)

use std::sync::Arc;

use tracing::info;

use salesbus::bus::{AmqpBroker, ConnectionManager, ConsumeOptions, ConsumerRuntime};
use salesbus::cache::{Cache, RedisCacheStore};
use salesbus::config::Config;
use salesbus::events::SALES_EVENTS_QUEUE;
use salesbus::invalidation::InvalidationHandler;
use salesbus::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load()?;

    let broker = AmqpBroker::new(config.messaging.url.clone());
    let manager = ConnectionManager::new(Arc::new(broker), config.messaging.reconnect_policy());

    let store = RedisCacheStore::new(&config.cache.url(), config.cache.call_timeout()).await?;
    let cache = Cache::new(Arc::new(store)).with_default_ttl(config.cache.default_ttl_secs);

    // Waits through broker outages until the reconnect budget is spent.
    let runtime = ConsumerRuntime::new(manager.clone());
    let subscribe = runtime.subscribe_when_ready(
        SALES_EVENTS_QUEUE,
        InvalidationHandler::new(cache),
        ConsumeOptions::default(),
    );
    let subscription = tokio::select! {
        result = subscribe => result?,
        _ = shutdown_signal() => {
            manager.shutdown().await;
            return Ok(());
        }
    };

    info!(
        queue = %subscription.queue(),
        consumer_tag = %subscription.consumer_tag(),
        "salesbus-invalidator started"
    );

    shutdown_signal().await;

    manager.shutdown().await;
    subscription.abort();

    info!("salesbus-invalidator stopped");
    Ok(())
}
