//! In-memory cache store for testing.
//!
//! Expiration follows tokio's clock, so tests can pause and advance time.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use super::{CacheError, CacheStore, Result};

/// A store operation, as recorded by `MockCacheStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    Get(String),
    Set(String),
    Delete(String),
}

struct Entry {
    value: String,
    ttl_secs: u64,
    expires_at: Instant,
}

/// Mock cache store.
#[derive(Default)]
pub struct MockCacheStore {
    entries: RwLock<HashMap<String, Entry>>,
    ops: RwLock<Vec<CacheOp>>,
    failures_left: RwLock<usize>,
}

impl MockCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` operations with a backend error.
    pub async fn fail_next(&self, count: usize) {
        *self.failures_left.write().await = count;
    }

    /// Every operation attempted, in order, including failed ones.
    pub async fn ops(&self) -> Vec<CacheOp> {
        self.ops.read().await.clone()
    }

    pub async fn deletes_of(&self, key: &str) -> usize {
        self.ops
            .read()
            .await
            .iter()
            .filter(|op| matches!(op, CacheOp::Delete(k) if k == key))
            .count()
    }

    /// Stored value, ignoring expiration.
    pub async fn raw(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }

    pub async fn ttl_of(&self, key: &str) -> Option<u64> {
        self.entries.read().await.get(key).map(|e| e.ttl_secs)
    }

    async fn record(&self, op: CacheOp) -> Result<()> {
        self.ops.write().await.push(op);

        let mut failures = self.failures_left.write().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(CacheError::Backend("mock cache failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MockCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.record(CacheOp::Get(key.to_string())).await?;

        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        self.record(CacheOp::Set(key.to_string())).await?;

        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                value,
                ttl_secs,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.record(CacheOp::Delete(key.to_string())).await?;

        self.entries.write().await.remove(key);
        Ok(())
    }
}
