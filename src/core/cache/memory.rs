use async_trait::async_trait;
use log::trace;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{CacheError, TagCache};

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    tags: HashMap<String, HashSet<String>>,
}

/// Process-local cache used when no Redis endpoint is configured.
#[derive(Default)]
pub struct MemoryTagCache {
    inner: RwLock<Inner>,
}

impl MemoryTagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of tags still tracking at least one key.
    pub async fn tag_count(&self) -> usize {
        self.inner.read().await.tags.len()
    }
}

#[async_trait]
impl TagCache for MemoryTagCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl: Duration, tags: &[String]) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let Inner { entries, tags: index } = &mut *inner;
        entries.retain(|_, e| e.expires_at > now);
        index.retain(|_, keys| {
            keys.retain(|k| entries.contains_key(k));
            !keys.is_empty()
        });
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        for tag in tags {
            inner.tags.entry(tag.clone()).or_default().insert(key.to_string());
        }
        trace!("memory cache put {} ({} tags)", key, tags.len());
        Ok(())
    }

    async fn invalidate(&self, tag: &str) -> Result<usize, CacheError> {
        let mut inner = self.inner.write().await;
        let Some(keys) = inner.tags.remove(tag) else {
            return Ok(0);
        };
        let mut dropped = 0;
        for key in keys {
            if inner.entries.remove(&key).is_some() {
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::{get_json, put_json};

    #[tokio::test]
    async fn test_get_after_put() {
        let cache = MemoryTagCache::new();
        cache
            .put("k", "v".into(), Duration::from_secs(60), &[])
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = MemoryTagCache::new();
        cache.put("k", "v".into(), Duration::ZERO, &[]).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate_only_drops_tagged_keys() {
        let cache = MemoryTagCache::new();
        let ttl = Duration::from_secs(60);
        cache.put("a", "1".into(), ttl, &["user#1".into()]).await.unwrap();
        cache.put("b", "2".into(), ttl, &["user#1".into(), "x".into()]).await.unwrap();
        cache.put("c", "3".into(), ttl, &["user#2".into()]).await.unwrap();

        assert_eq!(cache.invalidate("user#1").await.unwrap(), 2);
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.get("b").await.unwrap(), None);
        assert_eq!(cache.get("c").await.unwrap().as_deref(), Some("3"));
        assert_eq!(cache.invalidate("user#1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_keys_leave_the_tag_index() {
        let cache = MemoryTagCache::new();
        for i in 0..50 {
            let tag = format!("user#{i}");
            cache.put(&format!("ctx:{i}"), "{}".into(), Duration::ZERO, &[tag]).await.unwrap();
        }
        cache
            .put("live", "1".into(), Duration::from_secs(60), &["user#live".into()])
            .await
            .unwrap();
        assert_eq!(cache.tag_count().await, 1);
        assert_eq!(cache.invalidate("user#3").await.unwrap(), 0);
        assert_eq!(cache.invalidate("user#live").await.unwrap(), 1);
        assert_eq!(cache.tag_count().await, 0);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = MemoryTagCache::new();
        put_json(&cache, "ids", &vec![1_i64, 2, 3], Duration::from_secs(5), &[])
            .await
            .unwrap();
        let ids: Option<Vec<i64>> = get_json(&cache, "ids").await.unwrap();
        assert_eq!(ids, Some(vec![1, 2, 3]));

        cache.put("bad", "not json".into(), Duration::from_secs(5), &[]).await.unwrap();
        let bad: Result<Option<Vec<i64>>, _> = get_json(&cache, "bad").await;
        assert!(matches!(bad, Err(CacheError::Payload(_))));
    }
}
