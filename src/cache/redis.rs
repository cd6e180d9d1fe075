//! Redis cache store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use tracing::{debug, info};

use super::{CacheError, CacheStore, Result};

/// Redis cache store.
///
/// `ConnectionManager` reconnects on its own; every call is still bounded by
/// `call_timeout` so a stalled server cannot block the caller.
pub struct RedisCacheStore {
    conn: ConnectionManager,
    call_timeout: Duration,
}

impl RedisCacheStore {
    /// Create a new Redis cache store.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `call_timeout` - Upper bound for connecting and for each command
    pub async fn new(url: &str, call_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = tokio::time::timeout(call_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(call_timeout))??;

        info!(url = %url, "Connected to Redis for caching");

        Ok(Self { conn, call_timeout })
    }

    async fn bounded<T, F>(&self, command: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        tokio::time::timeout(self.call_timeout, command)
            .await
            .map_err(|_| CacheError::Timeout(self.call_timeout))?
            .map_err(CacheError::from)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self.bounded(conn.get(key)).await?;

        debug!(key = %key, hit = value.is_some(), "Read cache entry from Redis");
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = self.bounded(conn.set_ex(key, value, ttl_secs)).await?;

        debug!(key = %key, ttl_secs, "Stored cache entry in Redis");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = self.bounded(conn.del(key)).await?;

        debug!(key = %key, "Deleted cache entry from Redis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require Redis running
    // Run with: REDIS_URL=redis://localhost:6379 cargo test redis_cache -- --ignored

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_cache_set_get_delete() {
        let store = RedisCacheStore::new(&redis_url(), Duration::from_secs(2))
            .await
            .expect("Failed to connect to Redis");
        let key = format!("salesbus:test:{}", uuid::Uuid::new_v4());

        store.set(&key, "\"v\"".to_string(), 60).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("\"v\""));

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_cache_entry_expires() {
        let store = RedisCacheStore::new(&redis_url(), Duration::from_secs(2))
            .await
            .expect("Failed to connect to Redis");
        let key = format!("salesbus:test:{}", uuid::Uuid::new_v4());

        store.set(&key, "1".to_string(), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
