//! Persistence seam for posts and the records hanging off them.

mod memory;
mod pg;
pub mod sql;

pub use memory::MemoryContentStore;
pub use pg::PgContentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use super::models::{
    Attitude, Category, FediversePost, Post, Publisher, ReactionToggle, Subscription, SubscriptionTarget, Tag,
};
use super::predicate::Predicate;
use super::views::ViewBatch;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Backend(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        match e {
            Error::NotFound => StoreError::NotFound("record not found".to_string()),
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for StoreError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub take: usize,
    pub offset: usize,
}

impl Page {
    pub fn new(take: usize, offset: usize) -> Self {
        Self { take, offset }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PostOrder {
    /// Newest publication first.
    Published,
    /// Highest engagement score first, decayed against `now`.
    Ranked { now: DateTime<Utc> },
}

#[derive(Clone, Debug)]
pub struct NewReaction {
    pub symbol: String,
    pub attitude: Attitude,
    pub post_id: i64,
    pub account_id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagTally {
    pub flags: i64,
    pub total_views: i64,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Live (not soft-deleted) posts matching `predicate`.
    async fn list_posts(&self, predicate: &Predicate, page: Page, order: PostOrder) -> Result<Vec<Post>, StoreError>;

    async fn count_posts(&self, predicate: &Predicate) -> Result<i64, StoreError>;

    async fn get_post(&self, id: i64) -> Result<Option<Post>, StoreError>;

    /// Stores `post` with its category and tag links; the id and counters are assigned by the store.
    async fn insert_post(&self, post: Post) -> Result<Post, StoreError>;

    /// Writes the editable fields of `post`, including its category and tag links.
    async fn update_post(&self, post: &Post) -> Result<Post, StoreError>;

    async fn soft_delete_post(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Hard-deletes rows soft-deleted before `before`.
    async fn purge_deleted(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn reaction_tallies(&self, post_ids: &[i64]) -> Result<HashMap<i64, BTreeMap<String, i64>>, StoreError>;

    async fn reply_counts(&self, post_ids: &[i64]) -> Result<HashMap<i64, i64>, StoreError>;

    /// Positive minus negative reactions left since `since`, per post, best first.
    /// Posts without a positive balance are left out.
    async fn reaction_scores(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<(i64, i64)>, StoreError>;

    async fn toggle_reaction(&self, reaction: NewReaction) -> Result<ReactionToggle, StoreError>;

    async fn add_flag(&self, post_id: i64, account_id: i64) -> Result<FlagTally, StoreError>;

    async fn set_collapsed(&self, post_id: i64, collapsed: bool) -> Result<(), StoreError>;

    async fn apply_view_batch(&self, batch: &ViewBatch) -> Result<(), StoreError>;

    async fn publisher(&self, id: i64) -> Result<Option<Publisher>, StoreError>;

    async fn publisher_by_name(&self, name: &str) -> Result<Option<Publisher>, StoreError>;

    async fn publishers_of_accounts(&self, accounts: &[i64]) -> Result<Vec<Publisher>, StoreError>;

    async fn followed_publishers(&self, account: i64) -> Result<Vec<i64>, StoreError>;

    async fn subscribers(&self, target: SubscriptionTarget) -> Result<Vec<i64>, StoreError>;

    async fn subscribe(&self, follower: i64, target: SubscriptionTarget) -> Result<Subscription, StoreError>;

    async fn unsubscribe(&self, follower: i64, target: SubscriptionTarget) -> Result<(), StoreError>;

    async fn categories_by_alias(&self, aliases: &[String]) -> Result<Vec<Category>, StoreError>;

    async fn tags_by_alias(&self, aliases: &[String]) -> Result<Vec<Tag>, StoreError>;

    /// Returns the tags for `aliases`, creating the missing ones.
    async fn ensure_tags(&self, aliases: &[String]) -> Result<Vec<Tag>, StoreError>;

    async fn list_fediverse_posts(&self, limit: usize, before: Option<DateTime<Utc>>) -> Result<Vec<FediversePost>, StoreError>;
}
