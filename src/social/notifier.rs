//! Push notifications for new posts, replies and reactions.
//!
//! Subscription fan-out re-runs the listing visibility policy for every
//! subscriber, so nobody is told about a post they could not open.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::context::SocialContextResolver;
use super::models::{Category, Post, Publisher, SubscriptionTarget, Tag, Visibility};
use super::store::ContentStore;
use super::visibility::{self, VisibilityScope};
use crate::core::shared::utils::truncate_chars;
use crate::core::upstream::{Notification, PushGateway};

/// Characters of post content quoted in a notification body.
pub const SHORT_BODY_CHARS: usize = 80;
const RESOLVE_CONCURRENCY: usize = 8;

pub fn short_body(post: &Post) -> String {
    let text = post
        .body_str("content")
        .or_else(|| post.body_str("title"))
        .or_else(|| post.body_str("description"))
        .unwrap_or_default();
    truncate_chars(text, SHORT_BODY_CHARS).0
}

fn display(publisher: &Publisher) -> String {
    format!("{} ({})", publisher.nick, publisher.name)
}

pub struct SubscriptionNotifier {
    store: Arc<dyn ContentStore>,
    resolver: Arc<SocialContextResolver>,
    push: Arc<dyn PushGateway>,
}

impl SubscriptionNotifier {
    pub fn new(store: Arc<dyn ContentStore>, resolver: Arc<SocialContextResolver>, push: Arc<dyn PushGateway>) -> Self {
        Self { store, resolver, push }
    }

    /// Notifies subscribers of the author, then of each tag, then of each
    /// category, one message per audience. The author is never notified. A
    /// failed subscriber lookup skips only that audience. Returns how many
    /// notifications were delivered.
    pub async fn on_post_published(
        &self,
        post: &Post,
        author: &Publisher,
        tags: &[Tag],
        categories: &[Category],
    ) -> anyhow::Result<usize> {
        if post.is_draft || post.reply_id.is_some() || post.visibility == Visibility::None {
            return Ok(0);
        }
        if post.published_at.is_some_and(|at| at > Utc::now()) {
            debug!("Post {} is scheduled, skipping subscription notifications", post.id);
            return Ok(0);
        }

        let mut audiences: Vec<(SubscriptionTarget, String)> =
            vec![(SubscriptionTarget::Publisher(author.id), format!("New post from {}", display(author)))];
        audiences.extend(
            tags.iter()
                .map(|t| (SubscriptionTarget::Tag(t.id), format!("New post in {} by {}", t.name, display(author)))),
        );
        audiences.extend(categories.iter().map(|c| {
            (SubscriptionTarget::Category(c.id), format!("New post in {} by {}", c.name, display(author)))
        }));

        let body = short_body(post);
        let mut notified = 0;
        for (target, title) in audiences {
            let subscribers = match self.store.subscribers(target).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Failed to load subscribers of {:?} for post {}: {}", target, post.id, e);
                    continue;
                }
            };
            let subscribers: Vec<i64> = subscribers
                .into_iter()
                .filter(|account| author.account_id != Some(*account))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if subscribers.is_empty() {
                continue;
            }
            let allowed = self.permitted(post, subscribers).await;
            if allowed.is_empty() {
                continue;
            }

            let notification = Notification {
                topic: "interactive.subscription".to_string(),
                title,
                subtitle: "From your subscription".to_string(),
                body: body.clone(),
                priority: 3,
                metadata: json!({ "post_id": post.id, "publisher_id": author.id }),
            };
            match self.push.notify_batch(&allowed, &notification).await {
                Ok(()) => notified += allowed.len(),
                Err(e) => warn!("Failed to notify {} subscribers about post {}: {}", allowed.len(), post.id, e),
            }
        }
        info!("Notified {} subscribers about post {}", notified, post.id);
        Ok(notified)
    }

    /// Subscribers allowed to open `post` under the listing policy.
    async fn permitted(&self, post: &Post, subscribers: Vec<i64>) -> Vec<i64> {
        let scope = VisibilityScope::default();
        let mut allowed: Vec<i64> = stream::iter(subscribers)
            .map(|account| async move {
                match self.resolver.resolve(account).await {
                    Ok(ctx) => visibility::build(Some(&ctx), &scope).matches(post).then_some(account),
                    Err(e) => {
                        warn!("Skipping subscriber {}: failed to resolve social context: {}", account, e);
                        None
                    }
                }
            })
            .buffer_unordered(RESOLVE_CONCURRENCY)
            .filter_map(|account| async move { account })
            .collect()
            .await;
        allowed.sort_unstable();
        allowed
    }

    /// Tells the parent's author about a reply. Self-replies are not notified.
    pub async fn on_reply_published(&self, reply: &Post, replier: &Publisher) -> anyhow::Result<bool> {
        let Some(parent_id) = reply.reply_id else {
            return Ok(false);
        };
        let Some(parent) = self.store.get_post(parent_id).await? else {
            return Ok(false);
        };
        if parent.publisher_id == reply.publisher_id {
            return Ok(false);
        }
        let Some(account) = self.store.publisher(parent.publisher_id).await?.and_then(|p| p.account_id) else {
            return Ok(false);
        };
        if replier.account_id == Some(account) {
            return Ok(false);
        }

        let notification = Notification {
            topic: "interactive.reply".to_string(),
            title: "Post got replied".to_string(),
            subtitle: format!("{} replied your post #{}", replier.nick, parent.id),
            body: format!("{} replied you: {}", display(replier), short_body(reply)),
            priority: 4,
            metadata: json!({ "post_id": reply.id, "reply_to": parent.id }),
        };
        self.push.notify(account, &notification).await?;
        Ok(true)
    }

    /// Tells a post's author that someone reacted, unless they reacted themselves.
    pub async fn on_post_reacted(&self, post: &Post, reactor: i64, symbol: &str) -> anyhow::Result<bool> {
        let Some(account) = self.store.publisher(post.publisher_id).await?.and_then(|p| p.account_id) else {
            return Ok(false);
        };
        if account == reactor {
            return Ok(false);
        }
        let notification = Notification {
            topic: "interactive.feedback".to_string(),
            title: "Post got reacted".to_string(),
            subtitle: format!("Your post #{} got a new reaction", post.id),
            body: format!("Someone reacted {} to your post", symbol),
            priority: 3,
            metadata: json!({ "post_id": post.id, "symbol": symbol }),
        };
        self.push.notify(account, &notification).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MemoryTagCache;
    use crate::core::shared::test_utils::{personal, post, FakeDirectory, FakeGraph, RecordingPush};
    use crate::social::store::MemoryContentStore;
    use std::time::Duration;

    struct Fixture {
        notifier: SubscriptionNotifier,
        store: Arc<MemoryContentStore>,
        push: Arc<RecordingPush>,
    }

    // Author publisher 1 belongs to account 100; subscriber publishers 2..=4 to accounts 200..=400.
    async fn fixture(graph: FakeGraph, directory: FakeDirectory) -> Fixture {
        let store = Arc::new(MemoryContentStore::new());
        for (id, account) in [(1, 100), (2, 200), (3, 300), (4, 400)] {
            store.add_publisher(personal(id, account)).await;
        }
        let resolver = Arc::new(SocialContextResolver::new(
            Arc::new(MemoryTagCache::new()),
            store.clone(),
            Arc::new(graph),
            Arc::new(directory),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let push = Arc::new(RecordingPush::default());
        Fixture {
            notifier: SubscriptionNotifier::new(store.clone(), resolver, push.clone()),
            store,
            push,
        }
    }

    async fn subscribe_all(store: &MemoryContentStore, target: SubscriptionTarget) {
        for account in [200, 300, 400] {
            store.subscribe(account, target).await.unwrap();
        }
    }

    fn tag(id: i64, name: &str) -> Tag {
        Tag {
            id,
            alias: name.to_lowercase(),
            name: name.into(),
            description: String::new(),
        }
    }

    fn category(id: i64, name: &str) -> Category {
        Category {
            id,
            alias: name.to_lowercase(),
            name: name.into(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_each_audience_is_notified_separately() {
        let f = fixture(FakeGraph::new(), FakeDirectory::new()).await;
        subscribe_all(&f.store, SubscriptionTarget::Publisher(1)).await;
        f.store.subscribe(200, SubscriptionTarget::Tag(9)).await.unwrap();
        f.store.subscribe(100, SubscriptionTarget::Tag(9)).await.unwrap();

        let author = personal(1, 100);
        let count = f
            .notifier
            .on_post_published(&post(10, 1), &author, &[tag(9, "Rust")], &[])
            .await
            .unwrap();
        assert_eq!(count, 4);
        let sent = f.push.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, vec![200, 300, 400]);
        assert_eq!(sent[0].1.title, "New post from User 1 (user1)");
        assert_eq!(sent[0].1.topic, "interactive.subscription");
        assert_eq!(sent[1].0, vec![200]);
        assert_eq!(sent[1].1.title, "New post in Rust by User 1 (user1)");
    }

    #[tokio::test]
    async fn test_failed_audience_lookup_does_not_stop_the_rest() {
        let f = fixture(FakeGraph::new(), FakeDirectory::new()).await;
        f.store.subscribe(200, SubscriptionTarget::Tag(9)).await.unwrap();
        f.store.subscribe(300, SubscriptionTarget::Category(5)).await.unwrap();
        f.store.fail_subscriber_lookup(SubscriptionTarget::Tag(9));

        let count = f
            .notifier
            .on_post_published(&post(10, 1), &personal(1, 100), &[tag(9, "Rust")], &[category(5, "Tech")])
            .await
            .unwrap();
        assert_eq!(count, 1);
        let sent = f.push.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec![300]);
        assert_eq!(sent[0].1.title, "New post in Tech by User 1 (user1)");
    }

    #[tokio::test]
    async fn test_friends_post_skips_non_friend_subscriber() {
        let f = fixture(FakeGraph::new().friends(100, 300), FakeDirectory::new()).await;
        subscribe_all(&f.store, SubscriptionTarget::Publisher(1)).await;
        let mut p = post(10, 1);
        p.visibility = Visibility::Friends;

        f.notifier.on_post_published(&p, &personal(1, 100), &[], &[]).await.unwrap();
        assert_eq!(f.push.recipients(), vec![300]);
    }

    #[tokio::test]
    async fn test_selected_filtered_and_blocked_audiences() {
        let f = fixture(FakeGraph::new().block(100, 400), FakeDirectory::new()).await;
        subscribe_all(&f.store, SubscriptionTarget::Publisher(1)).await;
        let author = personal(1, 100);

        let mut selected = post(10, 1);
        selected.visibility = Visibility::Selected;
        selected.visible_users = vec![200, 400];
        f.notifier.on_post_published(&selected, &author, &[], &[]).await.unwrap();
        assert_eq!(f.push.recipients(), vec![200]);

        let mut filtered = post(11, 1);
        filtered.visibility = Visibility::Filtered;
        filtered.invisible_users = vec![200];
        f.notifier.on_post_published(&filtered, &author, &[], &[]).await.unwrap();
        assert_eq!(f.push.recipients(), vec![200, 300]);
    }

    #[tokio::test]
    async fn test_realm_post_only_reaches_members() {
        let f = fixture(FakeGraph::new(), FakeDirectory::new().member(300, 7)).await;
        subscribe_all(&f.store, SubscriptionTarget::Publisher(1)).await;
        let mut p = post(10, 1);
        p.realm_id = Some(7);
        f.notifier.on_post_published(&p, &personal(1, 100), &[], &[]).await.unwrap();
        assert_eq!(f.push.recipients(), vec![300]);
    }

    #[tokio::test]
    async fn test_no_notifications_for_owner_only_drafts_and_replies() {
        let f = fixture(FakeGraph::new(), FakeDirectory::new()).await;
        subscribe_all(&f.store, SubscriptionTarget::Publisher(1)).await;
        let author = personal(1, 100);

        let mut hidden = post(10, 1);
        hidden.visibility = Visibility::None;
        let mut draft = post(11, 1);
        draft.is_draft = true;
        let mut reply = post(12, 1);
        reply.reply_id = Some(10);
        let mut scheduled = post(13, 1);
        scheduled.published_at = Some(Utc::now() + chrono::Duration::hours(2));

        for p in [hidden, draft, reply, scheduled] {
            assert_eq!(f.notifier.on_post_published(&p, &author, &[], &[]).await.unwrap(), 0);
        }
        assert!(f.push.sent().is_empty());
    }

    #[tokio::test]
    async fn test_reply_notifies_parent_author_but_not_self() {
        let f = fixture(FakeGraph::new(), FakeDirectory::new()).await;
        f.store.put_post(post(10, 1)).await;

        let mut own_reply = post(11, 1);
        own_reply.reply_id = Some(10);
        assert!(!f.notifier.on_reply_published(&own_reply, &personal(1, 100)).await.unwrap());
        assert!(f.push.sent().is_empty());

        let mut reply = post(12, 2);
        reply.reply_id = Some(10);
        assert!(f.notifier.on_reply_published(&reply, &personal(2, 200)).await.unwrap());
        let sent = f.push.sent();
        assert_eq!(sent[0].0, vec![100]);
        assert_eq!(sent[0].1.title, "Post got replied");
        assert_eq!(sent[0].1.subtitle, "User 2 replied your post #10");
    }

    #[tokio::test]
    async fn test_reaction_by_author_is_silent() {
        let f = fixture(FakeGraph::new(), FakeDirectory::new()).await;
        let p = post(10, 1);
        assert!(!f.notifier.on_post_reacted(&p, 100, "heart").await.unwrap());
        assert!(f.notifier.on_post_reacted(&p, 200, "heart").await.unwrap());
        assert_eq!(f.push.recipients(), vec![100]);
    }
}
