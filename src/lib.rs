//! Salesbus - sales event messaging and cache invalidation
//!
//! A durable message-bus client with automatic reconnection, a cache store
//! client, and the pipeline that evicts the cached sales listing whenever a
//! sales event is published.

pub mod bus;
pub mod cache;
pub mod config;
pub mod events;
pub mod invalidation;
pub mod notifier;
pub mod utils;

pub use bus::{BusError, ConnectionManager, ConnectionState, Publisher, ReconnectPolicy};
pub use cache::{Cache, CacheError, CacheStore};
pub use config::Config;
pub use events::{DomainEvent, SaleEventKind};
pub use invalidation::{subscribe_cache_invalidation, InvalidationHandler};
pub use notifier::{MutationNotifier, NotifyOutcome};
