//! Activity feed: ranked internal posts, cached fediverse posts and news items
//! merged under one timestamp cursor.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::composer::{PostComposer, PostQuery};
use super::context::SocialContext;
use super::lifecycle::truncate_post_content;
use super::predicate::Predicate;
use super::store::{ContentStore, Page, PostOrder};
use super::SocialError;
use crate::core::config::FeedConfig;
use crate::core::upstream::NewsSource;

pub const INTERNAL_POST_TYPE: &str = "interactive.post";
pub const FEDIVERSE_POST_TYPE: &str = "fediverse.post";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeedEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    id: String,
}

impl FeedEntry {
    pub fn new(kind: impl Into<String>, id: impl ToString, payload: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp,
            id: id.to_string(),
        }
    }

    fn order(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeedPage {
    pub entries: Vec<FeedEntry>,
    /// Timestamp of the last entry, to pass back as the next cursor.
    pub next_cursor: Option<DateTime<Utc>>,
}

/// Per-source slots for a page of `limit` entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quotas {
    pub internal: usize,
    pub fediverse: usize,
    pub news: usize,
}

impl Quotas {
    pub fn split(limit: usize, config: &FeedConfig) -> Self {
        let internal = ((limit as f64 * config.internal_ratio).ceil() as usize).min(limit);
        let fediverse = ((limit as f64 * config.fediverse_ratio).ceil() as usize).min(limit - internal);
        Self {
            internal,
            fediverse,
            news: limit - internal - fediverse,
        }
    }
}

pub struct FeedAggregator {
    composer: Arc<PostComposer>,
    store: Arc<dyn ContentStore>,
    news: Arc<dyn NewsSource>,
    config: FeedConfig,
    timeout: Duration,
}

impl FeedAggregator {
    pub fn new(
        composer: Arc<PostComposer>,
        store: Arc<dyn ContentStore>,
        news: Arc<dyn NewsSource>,
        config: FeedConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            composer,
            store,
            news,
            config,
            timeout,
        }
    }

    /// Entries strictly older than `cursor`, newest first, at most `limit` of them.
    ///
    /// A failing source is skipped; the request fails only when every queried source failed.
    pub async fn get_feed(
        &self,
        viewer: Option<&SocialContext>,
        limit: usize,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<FeedPage, SocialError> {
        let limit = limit.clamp(1, self.config.max_limit.max(1));
        let quotas = Quotas::split(limit, &self.config);
        let (internal, fediverse, news) = futures::join!(
            self.internal(viewer, quotas.internal, cursor),
            self.fediverse(quotas.fediverse, cursor),
            self.news(quotas.news, cursor),
        );

        let mut attempted = 0;
        let mut failed = 0;
        let mut entries = Vec::with_capacity(limit);
        for source in [internal, fediverse, news].into_iter().flatten() {
            attempted += 1;
            match source {
                Ok(found) => entries.extend(found),
                Err(e) => {
                    failed += 1;
                    warn!("Feed source unavailable: {}", e);
                }
            }
        }
        if attempted > 0 && failed == attempted {
            return Err(SocialError::Internal("all feed sources are unavailable".to_string()));
        }

        if let Some(cursor) = cursor {
            entries.retain(|e| e.timestamp < cursor);
        }
        entries.sort_by(FeedEntry::order);
        entries.truncate(limit);
        debug!("Composed feed page with {} entries", entries.len());

        Ok(FeedPage {
            next_cursor: entries.last().map(|e| e.timestamp),
            entries,
        })
    }

    async fn internal(
        &self,
        viewer: Option<&SocialContext>,
        quota: usize,
        cursor: Option<DateTime<Utc>>,
    ) -> Option<Result<Vec<FeedEntry>, String>> {
        if quota == 0 {
            return None;
        }
        let query = PostQuery {
            before: cursor,
            ..Default::default()
        };
        let predicate = self.composer.predicate_for(viewer, &query, Utc::now());
        let order = PostOrder::Ranked {
            now: self.ranking_reference(&predicate, cursor).await,
        };
        let result = self
            .composer
            .list(viewer, &predicate, Page::new(quota, 0), order)
            .await
            .map_err(|e| format!("internal posts: {}", e))
            .and_then(|posts| {
                posts
                    .into_iter()
                    .map(|mut post| {
                        truncate_post_content(&mut post);
                        let timestamp = post.posted_at();
                        let id = post.id;
                        serde_json::to_value(post)
                            .map(|payload| FeedEntry::new(INTERNAL_POST_TYPE, id, payload, timestamp))
                            .map_err(|e| format!("internal posts: {}", e))
                    })
                    .collect()
            });
        Some(result)
    }

    /// Instant internal posts are ranked against: the cursor, or else the newest
    /// candidate's publication time so a first page keeps its order between requests.
    async fn ranking_reference(&self, candidates: &Predicate, cursor: Option<DateTime<Utc>>) -> DateTime<Utc> {
        if let Some(cursor) = cursor {
            return cursor;
        }
        match self
            .store
            .list_posts(candidates, Page::new(1, 0), PostOrder::Published)
            .await
        {
            Ok(mut newest) => newest.pop().map(|p| p.posted_at()).unwrap_or_else(Utc::now),
            Err(e) => {
                debug!("Falling back to the current time for feed ranking: {}", e);
                Utc::now()
            }
        }
    }

    async fn fediverse(&self, quota: usize, cursor: Option<DateTime<Utc>>) -> Option<Result<Vec<FeedEntry>, String>> {
        if quota == 0 {
            return None;
        }
        let result = self
            .store
            .list_fediverse_posts(quota, cursor)
            .await
            .map_err(|e| format!("fediverse posts: {}", e))
            .and_then(|posts| {
                posts
                    .into_iter()
                    .map(|post| {
                        let (id, timestamp) = (post.id, post.created_at);
                        serde_json::to_value(post)
                            .map(|payload| FeedEntry::new(FEDIVERSE_POST_TYPE, id, payload, timestamp))
                            .map_err(|e| format!("fediverse posts: {}", e))
                    })
                    .collect()
            });
        Some(result)
    }

    async fn news(&self, quota: usize, cursor: Option<DateTime<Utc>>) -> Option<Result<Vec<FeedEntry>, String>> {
        if quota == 0 {
            return None;
        }
        let result = match tokio::time::timeout(self.timeout, self.news.fetch(quota, cursor)).await {
            Ok(Ok(items)) => Ok(items
                .into_iter()
                .map(|item| FeedEntry::new(item.kind, item.id, item.content, item.created_at))
                .collect()),
            Ok(Err(e)) => Err(format!("news: {}", e)),
            Err(_) => Err(format!("news: timed out after {:?}", self.timeout)),
        };
        Some(result)
    }
}
