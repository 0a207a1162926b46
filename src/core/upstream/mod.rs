//! Contracts for the services this one depends on: identity/social graph,
//! communities, attachments, news and push delivery.

mod http;

pub use http::{FileClient, IdentityClient, PushClient, ReaderClient, UpstreamClient};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("{0} service is not configured")]
    NotConfigured(&'static str),
    #[error("request failed: {0}")]
    Request(String),
    #[error("upstream responded with status {0}")]
    Status(u16),
    #[error("invalid upstream payload: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UpstreamError::Decode(e.to_string())
        } else {
            UpstreamError::Request(e.to_string())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relationship {
    Friend,
    Blocked,
}

impl Relationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::Friend => "friend",
            Relationship::Blocked => "blocked",
        }
    }
}

/// Outgoing edges are the ones the account created; incoming edges point at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }
}

#[async_trait]
pub trait SocialGraph: Send + Sync {
    /// Account ids related to `account` by `relationship` in the given direction.
    async fn list_related(
        &self,
        account: i64,
        relationship: Relationship,
        direction: Direction,
    ) -> Result<Vec<i64>, UpstreamError>;
}

#[async_trait]
pub trait CommunityDirectory: Send + Sync {
    /// Communities `account` may see. Public communities are included when asked.
    async fn list_available(&self, account: i64, include_public: bool) -> Result<Vec<i64>, UpstreamError>;

    async fn resolve_alias(&self, alias: &str) -> Result<Option<i64>, UpstreamError>;
}

#[async_trait]
pub trait AttachmentService: Send + Sync {
    async fn adjust_usage(&self, rids: &[String], delta: i64) -> Result<(), UpstreamError>;

    async fn set_indexable(&self, rids: &[String], indexable: bool) -> Result<(), UpstreamError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait NewsSource: Send + Sync {
    /// Newest items strictly older than `cursor`.
    async fn fetch(&self, limit: usize, cursor: Option<DateTime<Utc>>) -> Result<Vec<NewsItem>, UpstreamError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    pub title: String,
    pub subtitle: String,
    pub body: String,
    pub priority: i32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn notify(&self, account: i64, notification: &Notification) -> Result<(), UpstreamError> {
        self.notify_batch(&[account], notification).await
    }

    async fn notify_batch(&self, accounts: &[i64], notification: &Notification) -> Result<(), UpstreamError>;
}
