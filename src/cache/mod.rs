//! Cache store client.
//!
//! String-keyed get/set/delete with expiration over a remote cache service.
//! Values are stored as UTF-8 JSON. Failures are surfaced to the caller and
//! never retried here.
//!
//! Implementations:
//! - `RedisCacheStore`: Redis via `redis::aio::ConnectionManager`
//! - `MockCacheStore`: In-memory store for testing

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

pub use mock::MockCacheStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCacheStore;

/// Expiration applied when the caller does not pick one.
pub const DEFAULT_TTL_SECS: u64 = 60;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Raw key/value storage with expiration.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a value. A miss is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one, expiring after `ttl_secs`.
    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<()>;

    /// Remove a value. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// JSON-typed cache over a `CacheStore`.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    default_ttl_secs: u64,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            default_ttl_secs: DEFAULT_TTL_SECS,
        }
    }

    pub fn with_default_ttl(mut self, ttl_secs: u64) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store `value`, expiring after `ttl_secs` or the default TTL.
    pub async fn set<T>(&self, key: &str, value: &T, ttl_secs: Option<u64>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value)?;
        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        self.store.set(key, raw, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await
    }

    /// Read-through: return the cached value or load, store and return it.
    ///
    /// Cache failures are logged and fall back to `load`; only `load` errors
    /// reach the caller.
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_secs: Option<u64>,
        load: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match self.get::<T>(key).await {
            Ok(Some(cached)) => {
                debug!(key = %key, "Cache hit");
                return Ok(cached);
            }
            Ok(None) => debug!(key = %key, "Cache miss"),
            Err(e) => warn!(key = %key, error = %e, "Cache read failed, loading from source"),
        }

        let value = load().await?;

        if let Err(e) = self.set(key, &value, ttl_secs).await {
            warn!(key = %key, error = %e, "Failed to populate cache");
        }
        Ok(value)
    }
}
