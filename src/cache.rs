//! Suggestion cache interface and the in-memory backend.
//!
//! The cache is modelled on a hash-of-counters store: a named hash holds
//! string fields with integer values, and the only write is an atomic
//! increment.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Command error: {0}")]
    CommandError(String),
}

impl CacheError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::CommandError(msg.into())
    }
}

#[async_trait]
pub trait SuggestionCache: Send + Sync {
    /// Atomically add `delta` to `field` in hash `key`, creating it at 0 first.
    ///
    /// # Returns
    ///
    /// * `Ok(i64)` - The value after the increment
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError>;

    /// Every field and value in hash `key`. Order is unspecified.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>, CacheError>;
}

/// Process-local cache. Increments hold the shard lock of the field's entry,
/// so concurrent increments of the same field never lose updates.
#[derive(Debug, Default)]
pub struct MemoryCache {
    hashes: DashMap<String, DashMap<String, i64>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SuggestionCache for MemoryCache {
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError> {
        let hash = self.hashes.entry(key.to_string()).or_default();
        let mut value = hash.entry(field.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>, CacheError> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .map(|entry| (entry.key().clone(), *entry.value()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
