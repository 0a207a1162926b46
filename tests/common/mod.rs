#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use postserver::core::cache::MemoryTagCache;
use postserver::core::config::{
    AppConfig, BackgroundConfig, FeedConfig, JobsConfig, ServerConfig, UpstreamConfig,
};
use postserver::core::upstream::{
    AttachmentService, CommunityDirectory, Direction, NewsItem, NewsSource, Notification, PushGateway,
    Relationship, SocialGraph, UpstreamError,
};
use postserver::main_module::{assemble, Backends, Runtime};
use postserver::social::models::{Post, PostType, Publisher, PublisherType, Visibility};
use postserver::social::store::MemoryContentStore;

pub const INTERNAL_TOKEN: &str = "internal-test-token";

pub fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database_url: "postgres://unused".to_string(),
        redis_url: None,
        internal_token: Some(INTERNAL_TOKEN.to_string()),
        upstream: UpstreamConfig {
            timeout: std::time::Duration::from_millis(500),
            ..Default::default()
        },
        social_context_ttl: std::time::Duration::from_secs(60),
        feed: FeedConfig::default(),
        jobs: JobsConfig {
            view_flush_interval: std::time::Duration::from_secs(3600),
            view_queue_capacity: 64,
            purge_interval: std::time::Duration::from_secs(3600),
            purge_retention: Duration::hours(1),
        },
        background: BackgroundConfig {
            workers: 2,
            queue_capacity: 32,
        },
    }
}

pub fn personal(id: i64, account: i64) -> Publisher {
    Publisher {
        id,
        publisher_type: PublisherType::Personal,
        name: format!("user{id}"),
        nick: format!("User {id}"),
        description: String::new(),
        realm_id: None,
        account_id: Some(account),
    }
}

pub fn post_at(id: i64, publisher_id: i64, visibility: Visibility, at: DateTime<Utc>) -> Post {
    Post {
        id,
        post_type: PostType::Story,
        body: json!({ "content": format!("post {id}") }),
        language: "en".to_string(),
        alias: None,
        alias_prefix: None,
        visibility,
        visible_users: Vec::new(),
        invisible_users: Vec::new(),
        realm_id: None,
        is_draft: false,
        published_at: Some(at),
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
        created_at: at,
        updated_at: at,
        deleted_at: None,
        metric: None,
    }
}

pub fn post(id: i64, publisher_id: i64, visibility: Visibility) -> Post {
    post_at(id, publisher_id, visibility, Utc::now() - Duration::minutes(id))
}

/// Relationship lists keyed by (account, relationship, direction).
#[derive(Default)]
pub struct Graph {
    edges: Mutex<HashMap<(i64, Relationship, Direction), Vec<i64>>>,
}

impl Graph {
    fn push(&self, from: i64, relationship: Relationship, direction: Direction, to: i64) {
        if let Ok(mut edges) = self.edges.lock() {
            edges.entry((from, relationship, direction)).or_default().push(to);
        }
    }

    pub fn friends(&self, a: i64, b: i64) {
        self.push(a, Relationship::Friend, Direction::Outgoing, b);
        self.push(b, Relationship::Friend, Direction::Outgoing, a);
    }

    pub fn block(&self, blocker: i64, blocked: i64) {
        self.push(blocker, Relationship::Blocked, Direction::Outgoing, blocked);
        self.push(blocked, Relationship::Blocked, Direction::Incoming, blocker);
    }
}

#[async_trait]
impl SocialGraph for Graph {
    async fn list_related(
        &self,
        account: i64,
        relationship: Relationship,
        direction: Direction,
    ) -> Result<Vec<i64>, UpstreamError> {
        Ok(self
            .edges
            .lock()
            .map(|edges| edges.get(&(account, relationship, direction)).cloned().unwrap_or_default())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct Directory {
    pub members: Mutex<HashMap<i64, Vec<i64>>>,
    pub aliases: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl CommunityDirectory for Directory {
    async fn list_available(&self, account: i64, _include_public: bool) -> Result<Vec<i64>, UpstreamError> {
        Ok(self
            .members
            .lock()
            .map(|m| m.get(&account).cloned().unwrap_or_default())
            .unwrap_or_default())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<i64>, UpstreamError> {
        Ok(self.aliases.lock().ok().and_then(|a| a.get(alias).copied()))
    }
}

#[derive(Default)]
pub struct Attachments {
    pub usage: Mutex<Vec<(Vec<String>, i64)>>,
}

#[async_trait]
impl AttachmentService for Attachments {
    async fn adjust_usage(&self, rids: &[String], delta: i64) -> Result<(), UpstreamError> {
        if let Ok(mut usage) = self.usage.lock() {
            usage.push((rids.to_vec(), delta));
        }
        Ok(())
    }

    async fn set_indexable(&self, _rids: &[String], _indexable: bool) -> Result<(), UpstreamError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct News {
    pub items: Vec<NewsItem>,
}

#[async_trait]
impl NewsSource for News {
    async fn fetch(&self, limit: usize, cursor: Option<DateTime<Utc>>) -> Result<Vec<NewsItem>, UpstreamError> {
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
pub struct Push {
    pub sent: Mutex<Vec<(i64, Notification)>>,
}

impl Push {
    pub fn recipients(&self) -> Vec<i64> {
        self.sent
            .lock()
            .map(|s| s.iter().map(|(a, _)| *a).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PushGateway for Push {
    async fn notify_batch(&self, accounts: &[i64], notification: &Notification) -> Result<(), UpstreamError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.extend(accounts.iter().map(|a| (*a, notification.clone())));
        }
        Ok(())
    }
}

pub struct TestApp {
    pub runtime: Runtime,
    pub store: Arc<MemoryContentStore>,
    pub graph: Arc<Graph>,
    pub directory: Arc<Directory>,
    pub attachments: Arc<Attachments>,
    pub push: Arc<Push>,
}

pub fn spawn_app(store: Arc<MemoryContentStore>, graph: Graph, directory: Directory, news: News) -> TestApp {
    let graph = Arc::new(graph);
    let directory = Arc::new(directory);
    let attachments = Arc::new(Attachments::default());
    let push = Arc::new(Push::default());
    let runtime = assemble(
        test_config(),
        Backends {
            store: store.clone(),
            cache: Arc::new(MemoryTagCache::new()),
            graph: graph.clone(),
            communities: directory.clone(),
            attachments: attachments.clone(),
            news: Arc::new(news),
            push: push.clone(),
        },
    );
    TestApp {
        runtime,
        store,
        graph,
        directory,
        attachments,
        push,
    }
}
