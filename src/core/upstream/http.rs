use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::{
    AttachmentService, CommunityDirectory, Direction, NewsItem, NewsSource, Notification, PushGateway,
    Relationship, SocialGraph, UpstreamError,
};

/// Thin JSON-over-HTTP client bound to one upstream base URL.
///
/// An absent base URL yields `UpstreamError::NotConfigured` on every call, which
/// callers treat the same as an unreachable service.
#[derive(Clone)]
pub struct UpstreamClient {
    name: &'static str,
    http: reqwest::Client,
    base_url: Option<String>,
}

impl UpstreamClient {
    pub fn new(name: &'static str, base_url: Option<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            name,
            http,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, UpstreamError> {
        let Some(base) = &self.base_url else {
            return Err(UpstreamError::NotConfigured(self.name));
        };
        reqwest::Url::parse(&format!("{}{}", base, path))
            .map_err(|e| UpstreamError::Request(format!("invalid {} service URL: {}", self.name, e)))
    }

    /// `path` followed by `segment` as a single percent-encoded path segment.
    fn segment_url(&self, path: &str, segment: &str) -> Result<reqwest::Url, UpstreamError> {
        let mut url = self.url(path)?;
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Request(format!("{} service URL cannot take a path", self.name)))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, UpstreamError> {
        self.get_json_at(self.url(path)?, query).await
    }

    async fn get_json_at<T: DeserializeOwned>(
        &self,
        url: reqwest::Url,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        debug!("{} GET {}", self.name, url);
        let response = self.http.get(url).query(query).send().await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }
        Ok(response.json::<T>().await?)
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), UpstreamError> {
        let url = self.url(path)?;
        debug!("{} POST {}", self.name, url);
        let response = self.http.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct AccountList {
    accounts: Vec<i64>,
}

#[derive(Deserialize)]
struct RealmList {
    realms: Vec<i64>,
}

#[derive(Deserialize)]
struct RealmRef {
    id: i64,
}

/// Identity service: relationships and realm (community) membership.
#[derive(Clone)]
pub struct IdentityClient {
    client: UpstreamClient,
}

impl IdentityClient {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SocialGraph for IdentityClient {
    async fn list_related(
        &self,
        account: i64,
        relationship: Relationship,
        direction: Direction,
    ) -> Result<Vec<i64>, UpstreamError> {
        let list: AccountList = self
            .client
            .get_json(
                &format!("/internal/accounts/{}/relationships", account),
                &[
                    ("type", relationship.as_str().to_string()),
                    ("direction", direction.as_str().to_string()),
                ],
            )
            .await?;
        Ok(list.accounts)
    }
}

#[async_trait]
impl CommunityDirectory for IdentityClient {
    async fn list_available(&self, account: i64, include_public: bool) -> Result<Vec<i64>, UpstreamError> {
        let list: RealmList = self
            .client
            .get_json(
                "/internal/realms/available",
                &[
                    ("account", account.to_string()),
                    ("include_public", include_public.to_string()),
                ],
            )
            .await?;
        Ok(list.realms)
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<i64>, UpstreamError> {
        let url = self.client.segment_url("/internal/realms/by-alias", alias)?;
        match self.client.get_json_at::<RealmRef>(url, &[]).await {
            Ok(realm) => Ok(Some(realm.id)),
            Err(UpstreamError::Status(404)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// File service: attachment reference counting and indexability.
#[derive(Clone)]
pub struct FileClient {
    client: UpstreamClient,
}

impl FileClient {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AttachmentService for FileClient {
    async fn adjust_usage(&self, rids: &[String], delta: i64) -> Result<(), UpstreamError> {
        if rids.is_empty() {
            return Ok(());
        }
        self.client
            .post_json("/internal/attachments/usage", &json!({ "rids": rids, "delta": delta }))
            .await
    }

    async fn set_indexable(&self, rids: &[String], indexable: bool) -> Result<(), UpstreamError> {
        if rids.is_empty() {
            return Ok(());
        }
        self.client
            .post_json(
                "/internal/attachments/visibility",
                &json!({ "rids": rids, "indexable": indexable }),
            )
            .await
    }
}

#[derive(Deserialize)]
struct WireNewsItem {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    content: serde_json::Value,
    created_at: i64,
}

#[derive(Deserialize)]
struct NewsPage {
    items: Vec<WireNewsItem>,
}

/// Reader service: external news stream.
#[derive(Clone)]
pub struct ReaderClient {
    client: UpstreamClient,
}

impl ReaderClient {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NewsSource for ReaderClient {
    async fn fetch(&self, limit: usize, cursor: Option<DateTime<Utc>>) -> Result<Vec<NewsItem>, UpstreamError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.timestamp_millis().to_string()));
        }
        let page: NewsPage = self.client.get_json("/internal/feed", &query).await?;
        page.items
            .into_iter()
            .map(|item| {
                let created_at = DateTime::from_timestamp_millis(item.created_at)
                    .ok_or_else(|| UpstreamError::Decode(format!("bad timestamp {}", item.created_at)))?;
                Ok(NewsItem {
                    kind: item.kind,
                    id: item.id,
                    content: item.content,
                    created_at,
                })
            })
            .collect()
    }
}

/// Pusher service: notification delivery.
#[derive(Clone)]
pub struct PushClient {
    client: UpstreamClient,
}

impl PushClient {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PushGateway for PushClient {
    async fn notify_batch(&self, accounts: &[i64], notification: &Notification) -> Result<(), UpstreamError> {
        if accounts.is_empty() {
            return Ok(());
        }
        self.client
            .post_json(
                "/internal/notifications",
                &json!({ "accounts": accounts, "notification": notification }),
            )
            .await
    }
}
