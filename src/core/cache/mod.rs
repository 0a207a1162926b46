//! Tag-aware key/value cache.
//!
//! Entries are written with a TTL and any number of tags; invalidating a tag
//! drops every entry written under it without touching unrelated keys.

mod memory;
#[cfg(feature = "cache")]
mod redis_cache;

pub use memory::MemoryTagCache;
#[cfg(feature = "cache")]
pub use redis_cache::RedisTagCache;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

#[async_trait]
pub trait TagCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn put(&self, key: &str, value: String, ttl: Duration, tags: &[String]) -> Result<(), CacheError>;

    /// Removes every entry stored under `tag`, returning how many keys were dropped.
    async fn invalidate(&self, tag: &str) -> Result<usize, CacheError>;
}

pub async fn get_json<T: DeserializeOwned>(cache: &dyn TagCache, key: &str) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    cache: &dyn TagCache,
    key: &str,
    value: &T,
    ttl: Duration,
    tags: &[String],
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    cache.put(key, raw, ttl, tags).await
}
