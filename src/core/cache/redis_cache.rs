use async_trait::async_trait;
use log::{debug, trace};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use super::{CacheError, TagCache};

const KEY_PREFIX: &str = "interactive:cache:";
const TAG_PREFIX: &str = "interactive:tag:";

/// Redis backed cache. Each tag is a Redis set holding the keys written under it.
pub struct RedisTagCache {
    client: Arc<redis::Client>,
}

impl RedisTagCache {
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self { client }
    }

    fn key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    fn tag(tag: &str) -> String {
        format!("{}{}", TAG_PREFIX, tag)
    }
}

#[async_trait]
impl TagCache for RedisTagCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(Self::key(key)).await?;
        trace!("redis cache {} {}", if value.is_some() { "hit" } else { "miss" }, key);
        Ok(value)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration, tags: &[String]) -> Result<(), CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let full_key = Self::key(key);
        let seconds = ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.atomic().set_ex(&full_key, value, seconds).ignore();
        for tag in tags {
            let tag_key = Self::tag(tag);
            // The tag set lives at least as long as the newest entry it points to.
            pipe.sadd(&tag_key, &full_key)
                .ignore()
                .expire(&tag_key, seconds as i64)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn invalidate(&self, tag: &str) -> Result<usize, CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let tag_key = Self::tag(tag);
        let keys: Vec<String> = conn.smembers(&tag_key).await?;

        let mut dropped = 0;
        if !keys.is_empty() {
            dropped = conn.del(&keys).await?;
        }
        let _: () = conn.del(&tag_key).await?;
        debug!("Invalidated {} cache entries for tag {}", dropped, tag);
        Ok(dropped)
    }
}
