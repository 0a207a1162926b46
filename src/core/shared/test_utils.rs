use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::upstream::{
    AttachmentService, CommunityDirectory, Direction, NewsItem, NewsSource, Notification, PushGateway,
    Relationship, SocialGraph, UpstreamError,
};
use crate::social::models::{Post, PostType, Publisher, PublisherType, Visibility};
use crate::social::store::MemoryContentStore;

/// A public, published, top-level story created a minute ago.
pub fn post(id: i64, publisher_id: i64) -> Post {
    let created = Utc::now() - Duration::minutes(1);
    Post {
        id,
        post_type: PostType::Story,
        body: json!({ "content": format!("post {id}") }),
        language: "en".to_string(),
        alias: None,
        alias_prefix: None,
        visibility: Visibility::All,
        visible_users: Vec::new(),
        invisible_users: Vec::new(),
        realm_id: None,
        is_draft: false,
        published_at: Some(created),
        published_until: None,
        reply_id: None,
        repost_id: None,
        total_upvote: 0,
        total_downvote: 0,
        total_views: 0,
        total_aggressive_views: 0,
        is_collapsed: false,
        locked_at: None,
        pinned_at: None,
        edited_at: None,
        publisher_id,
        category_ids: Vec::new(),
        tag_ids: Vec::new(),
        created_at: created,
        updated_at: created,
        deleted_at: None,
        metric: None,
    }
}

pub fn post_at(id: i64, publisher_id: i64, at: DateTime<Utc>) -> Post {
    let mut p = post(id, publisher_id);
    p.created_at = at;
    p.updated_at = at;
    p.published_at = Some(at);
    p
}

pub fn personal(id: i64, account_id: i64) -> Publisher {
    Publisher {
        id,
        publisher_type: PublisherType::Personal,
        name: format!("user{id}"),
        nick: format!("User {id}"),
        description: String::new(),
        realm_id: None,
        account_id: Some(account_id),
    }
}

pub fn organization(id: i64, account_id: i64, realm_id: i64) -> Publisher {
    Publisher {
        id,
        publisher_type: PublisherType::Organization,
        name: format!("org{id}"),
        nick: format!("Org {id}"),
        description: String::new(),
        realm_id: Some(realm_id),
        account_id: Some(account_id),
    }
}

pub async fn seeded_store(posts: Vec<Post>) -> Arc<MemoryContentStore> {
    let store = Arc::new(MemoryContentStore::new());
    for p in posts {
        store.put_post(p).await;
    }
    store
}

#[derive(Default)]
pub struct FakeGraph {
    edges: Mutex<HashMap<(i64, Relationship, Direction), Vec<i64>>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, account: i64, relationship: Relationship, direction: Direction, related: Vec<i64>) -> Self {
        if let Ok(mut edges) = self.edges.lock() {
            edges.insert((account, relationship, direction), related);
        }
        self
    }

    /// Mutual friendship: both sides list each other.
    pub fn friends(self, a: i64, b: i64) -> Self {
        let push = |edges: &mut HashMap<_, Vec<i64>>, from: i64, to: i64| {
            edges
                .entry((from, Relationship::Friend, Direction::Outgoing))
                .or_default()
                .push(to);
        };
        if let Ok(mut edges) = self.edges.lock() {
            push(&mut edges, a, b);
            push(&mut edges, b, a);
        }
        self
    }

    /// `blocker` blocks `blocked`.
    pub fn block(self, blocker: i64, blocked: i64) -> Self {
        if let Ok(mut edges) = self.edges.lock() {
            edges
                .entry((blocker, Relationship::Blocked, Direction::Outgoing))
                .or_default()
                .push(blocked);
            edges
                .entry((blocked, Relationship::Blocked, Direction::Incoming))
                .or_default()
                .push(blocker);
        }
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocialGraph for FakeGraph {
    async fn list_related(
        &self,
        account: i64,
        relationship: Relationship,
        direction: Direction,
    ) -> Result<Vec<i64>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status(503));
        }
        let edges = self.edges.lock().map_err(|e| UpstreamError::Request(e.to_string()))?;
        Ok(edges.get(&(account, relationship, direction)).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    members: Mutex<HashMap<i64, Vec<i64>>>,
    aliases: Mutex<HashMap<String, i64>>,
    failing: AtomicBool,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member(self, account: i64, realm: i64) -> Self {
        if let Ok(mut members) = self.members.lock() {
            members.entry(account).or_default().push(realm);
        }
        self
    }

    pub fn alias(self, alias: &str, realm: i64) -> Self {
        if let Ok(mut aliases) = self.aliases.lock() {
            aliases.insert(alias.to_string(), realm);
        }
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommunityDirectory for FakeDirectory {
    async fn list_available(&self, account: i64, _include_public: bool) -> Result<Vec<i64>, UpstreamError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Status(503));
        }
        let members = self.members.lock().map_err(|e| UpstreamError::Request(e.to_string()))?;
        Ok(members.get(&account).cloned().unwrap_or_default())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<i64>, UpstreamError> {
        let aliases = self.aliases.lock().map_err(|e| UpstreamError::Request(e.to_string()))?;
        Ok(aliases.get(alias).copied())
    }
}

#[derive(Default)]
pub struct FakeAttachments {
    pub usage: Mutex<Vec<(Vec<String>, i64)>>,
    pub indexable: Mutex<Vec<(Vec<String>, bool)>>,
}

impl FakeAttachments {
    pub fn usage_calls(&self) -> Vec<(Vec<String>, i64)> {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AttachmentService for FakeAttachments {
    async fn adjust_usage(&self, rids: &[String], delta: i64) -> Result<(), UpstreamError> {
        if let Ok(mut usage) = self.usage.lock() {
            usage.push((rids.to_vec(), delta));
        }
        Ok(())
    }

    async fn set_indexable(&self, rids: &[String], indexable: bool) -> Result<(), UpstreamError> {
        if let Ok(mut calls) = self.indexable.lock() {
            calls.push((rids.to_vec(), indexable));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeNews {
    pub items: Vec<NewsItem>,
    pub failing: bool,
}

#[async_trait]
impl NewsSource for FakeNews {
    async fn fetch(&self, limit: usize, cursor: Option<DateTime<Utc>>) -> Result<Vec<NewsItem>, UpstreamError> {
        if self.failing {
            return Err(UpstreamError::Status(502));
        }
        let mut items: Vec<NewsItem> = self
            .items
            .iter()
            .filter(|i| cursor.map_or(true, |c| i.created_at < c))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }
}

#[derive(Default)]
pub struct RecordingPush {
    sent: Mutex<Vec<(Vec<i64>, Notification)>>,
}

impl RecordingPush {
    pub fn sent(&self) -> Vec<(Vec<i64>, Notification)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Every account that received anything, in delivery order.
    pub fn recipients(&self) -> Vec<i64> {
        self.sent().into_iter().flat_map(|(accounts, _)| accounts).collect()
    }
}

#[async_trait]
impl PushGateway for RecordingPush {
    async fn notify_batch(&self, accounts: &[i64], notification: &Notification) -> Result<(), UpstreamError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((accounts.to_vec(), notification.clone()));
        }
        Ok(())
    }
}
