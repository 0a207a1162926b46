use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;
use tokio::sync::RwLock;

use super::{ContentStore, FlagTally, NewReaction, Page, PostOrder, StoreError};
use crate::social::models::{
    Attitude, Category, FediversePost, Post, Publisher, Reaction, ReactionToggle, Subscription, SubscriptionTarget,
    Tag,
};
use crate::social::predicate::Predicate;
use crate::social::ranking::rank_score;
use crate::social::views::ViewBatch;

#[derive(Default)]
struct Tables {
    next_id: i64,
    posts: BTreeMap<i64, Post>,
    publishers: BTreeMap<i64, Publisher>,
    subscriptions: Vec<Subscription>,
    reactions: Vec<Reaction>,
    flags: HashSet<(i64, i64)>,
    views: HashSet<(i64, i64)>,
    categories: BTreeMap<i64, Category>,
    tags: BTreeMap<i64, Tag>,
    fediverse: Vec<FediversePost>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn live_post_mut(&mut self, id: i64) -> Result<&mut Post, StoreError> {
        self.posts
            .get_mut(&id)
            .filter(|p| p.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound(format!("post {} not found", id)))
    }
}

/// Store that keeps everything in process memory and evaluates predicates
/// with [`Predicate::matches`]. Used for local development and tests.
#[derive(Default)]
pub struct MemoryContentStore {
    tables: RwLock<Tables>,
    fail_enrichment: AtomicBool,
    failing_subscriber_lookups: Mutex<HashSet<SubscriptionTarget>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the reaction/reply batch lookups fail, for exercising degraded listings.
    pub fn set_enrichment_failure(&self, fail: bool) {
        self.fail_enrichment.store(fail, AtomicOrdering::Relaxed);
    }

    /// Makes [`ContentStore::subscribers`] fail for `target`.
    pub fn fail_subscriber_lookup(&self, target: SubscriptionTarget) {
        if let Ok(mut failing) = self.failing_subscriber_lookups.lock() {
            failing.insert(target);
        }
    }

    pub async fn add_publisher(&self, publisher: Publisher) {
        let mut tables = self.tables.write().await;
        tables.next_id = tables.next_id.max(publisher.id);
        tables.publishers.insert(publisher.id, publisher);
    }

    pub async fn add_category(&self, category: Category) {
        let mut tables = self.tables.write().await;
        tables.next_id = tables.next_id.max(category.id);
        tables.categories.insert(category.id, category);
    }

    pub async fn add_fediverse_post(&self, post: FediversePost) {
        self.tables.write().await.fediverse.push(post);
    }

    /// Inserts `post` keeping its id and counters as given.
    pub async fn put_post(&self, post: Post) {
        let mut tables = self.tables.write().await;
        tables.next_id = tables.next_id.max(post.id);
        tables.posts.insert(post.id, post);
    }

    fn enrichment_check(&self) -> Result<(), StoreError> {
        if self.fail_enrichment.load(AtomicOrdering::Relaxed) {
            return Err(StoreError::Backend("enrichment unavailable".to_string()));
        }
        Ok(())
    }
}

fn compare(order: PostOrder, a: &Post, b: &Post) -> Ordering {
    let primary = match order {
        PostOrder::Published => b.posted_at().cmp(&a.posted_at()),
        PostOrder::Ranked { now } => {
            let sa = rank_score(a.total_upvote, a.total_downvote, a.total_aggressive_views, a.posted_at(), now);
            let sb = rank_score(b.total_upvote, b.total_downvote, b.total_aggressive_views, b.posted_at(), now);
            sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
        }
    };
    primary.then_with(|| b.id.cmp(&a.id))
}

fn target_matches(sub: &Subscription, follower: i64, target: SubscriptionTarget) -> bool {
    sub.follower_id == follower && sub.target == target
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_posts(&self, predicate: &Predicate, page: Page, order: PostOrder) -> Result<Vec<Post>, StoreError> {
        let tables = self.tables.read().await;
        let mut found: Vec<Post> = tables
            .posts
            .values()
            .filter(|p| p.deleted_at.is_none() && predicate.matches(p))
            .cloned()
            .collect();
        found.sort_by(|a, b| compare(order, a, b));
        Ok(found.into_iter().skip(page.offset).take(page.take).collect())
    }

    async fn count_posts(&self, predicate: &Predicate) -> Result<i64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .posts
            .values()
            .filter(|p| p.deleted_at.is_none() && predicate.matches(p))
            .count() as i64)
    }

    async fn get_post(&self, id: i64) -> Result<Option<Post>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.posts.get(&id).filter(|p| p.deleted_at.is_none()).cloned())
    }

    async fn insert_post(&self, mut post: Post) -> Result<Post, StoreError> {
        let mut tables = self.tables.write().await;
        if let (Some(prefix), Some(alias)) = (&post.alias_prefix, &post.alias) {
            let taken = tables
                .posts
                .values()
                .any(|p| p.alias_prefix.as_ref() == Some(prefix) && p.alias.as_ref() == Some(alias));
            if taken {
                return Err(StoreError::Conflict(format!("alias {}:{} already in use", prefix, alias)));
            }
        }
        post.id = tables.id();
        post.total_upvote = 0;
        post.total_downvote = 0;
        post.total_views = 0;
        post.total_aggressive_views = 0;
        post.metric = None;
        tables.posts.insert(post.id, post.clone());
        Ok(post)
    }

    async fn update_post(&self, post: &Post) -> Result<Post, StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables.live_post_mut(post.id)?;
        let counters = (
            stored.total_upvote,
            stored.total_downvote,
            stored.total_views,
            stored.total_aggressive_views,
            stored.is_collapsed,
        );
        *stored = post.clone();
        (
            stored.total_upvote,
            stored.total_downvote,
            stored.total_views,
            stored.total_aggressive_views,
            stored.is_collapsed,
        ) = counters;
        stored.metric = None;
        Ok(stored.clone())
    }

    async fn soft_delete_post(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.live_post_mut(id)?.deleted_at = Some(at);
        Ok(())
    }

    async fn purge_deleted(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let doomed: HashSet<i64> = tables
            .posts
            .values()
            .filter(|p| p.deleted_at.is_some_and(|d| d < before))
            .map(|p| p.id)
            .collect();
        tables.posts.retain(|id, _| !doomed.contains(id));
        tables.reactions.retain(|r| !doomed.contains(&r.post_id));
        tables.flags.retain(|(post, _)| !doomed.contains(post));
        tables.views.retain(|(post, _)| !doomed.contains(post));
        Ok(doomed.len())
    }

    async fn reaction_tallies(&self, post_ids: &[i64]) -> Result<HashMap<i64, BTreeMap<String, i64>>, StoreError> {
        self.enrichment_check()?;
        let tables = self.tables.read().await;
        let mut out: HashMap<i64, BTreeMap<String, i64>> = HashMap::new();
        for reaction in tables.reactions.iter().filter(|r| post_ids.contains(&r.post_id)) {
            *out.entry(reaction.post_id)
                .or_default()
                .entry(reaction.symbol.clone())
                .or_insert(0) += 1;
        }
        Ok(out)
    }

    async fn reply_counts(&self, post_ids: &[i64]) -> Result<HashMap<i64, i64>, StoreError> {
        self.enrichment_check()?;
        let tables = self.tables.read().await;
        let mut out = HashMap::new();
        for post in tables.posts.values().filter(|p| p.deleted_at.is_none()) {
            if let Some(parent) = post.reply_id.filter(|r| post_ids.contains(r)) {
                *out.entry(parent).or_insert(0) += 1;
            }
        }
        Ok(out)
    }

    async fn reaction_scores(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<(i64, i64)>, StoreError> {
        let tables = self.tables.read().await;
        let mut points: HashMap<i64, i64> = HashMap::new();
        for reaction in tables.reactions.iter().filter(|r| r.created_at >= since) {
            let delta = match reaction.attitude {
                Attitude::Positive => 1,
                Attitude::Negative => -1,
                Attitude::Neutral => 0,
            };
            *points.entry(reaction.post_id).or_insert(0) += delta;
        }
        let mut scores: Vec<(i64, i64)> = points.into_iter().filter(|(_, p)| *p > 0).collect();
        scores.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        scores.truncate(limit);
        Ok(scores)
    }

    async fn toggle_reaction(&self, reaction: NewReaction) -> Result<ReactionToggle, StoreError> {
        let mut tables = self.tables.write().await;
        tables.live_post_mut(reaction.post_id)?;

        let existing = tables.reactions.iter().position(|r| {
            r.post_id == reaction.post_id && r.account_id == reaction.account_id && r.symbol == reaction.symbol
        });
        let (attitude, delta, outcome) = match existing {
            Some(idx) => {
                let removed = tables.reactions.remove(idx);
                (removed.attitude, -1, ReactionToggle::Removed)
            }
            None => {
                let created = Reaction {
                    id: tables.id(),
                    symbol: reaction.symbol,
                    attitude: reaction.attitude,
                    post_id: reaction.post_id,
                    account_id: reaction.account_id,
                    created_at: Utc::now(),
                };
                tables.reactions.push(created.clone());
                (created.attitude, 1, ReactionToggle::Added(created))
            }
        };

        let post = tables.live_post_mut(reaction.post_id)?;
        match attitude {
            Attitude::Positive => post.total_upvote += delta,
            Attitude::Negative => post.total_downvote += delta,
            Attitude::Neutral => {}
        }
        Ok(outcome)
    }

    async fn add_flag(&self, post_id: i64, account_id: i64) -> Result<FlagTally, StoreError> {
        let mut tables = self.tables.write().await;
        let total_views = tables.live_post_mut(post_id)?.total_views;
        if !tables.flags.insert((post_id, account_id)) {
            return Err(StoreError::Conflict("flag already exists".to_string()));
        }
        let flags = tables.flags.iter().filter(|(p, _)| *p == post_id).count() as i64;
        Ok(FlagTally { flags, total_views })
    }

    async fn set_collapsed(&self, post_id: i64, collapsed: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.live_post_mut(post_id)?.is_collapsed = collapsed;
        Ok(())
    }

    async fn apply_view_batch(&self, batch: &ViewBatch) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        for event in &batch.unique {
            if tables.posts.contains_key(&event.post_id) {
                tables.views.insert((event.post_id, event.account_id));
            }
        }
        for (&post_id, &impressions) in &batch.impressions {
            let unique = tables.views.iter().filter(|(p, _)| *p == post_id).count() as i64;
            if let Some(post) = tables.posts.get_mut(&post_id) {
                post.total_views = unique;
                post.total_aggressive_views += impressions;
            }
        }
        Ok(())
    }

    async fn publisher(&self, id: i64) -> Result<Option<Publisher>, StoreError> {
        Ok(self.tables.read().await.publishers.get(&id).cloned())
    }

    async fn publisher_by_name(&self, name: &str) -> Result<Option<Publisher>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.publishers.values().find(|p| p.name == name).cloned())
    }

    async fn publishers_of_accounts(&self, accounts: &[i64]) -> Result<Vec<Publisher>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .publishers
            .values()
            .filter(|p| p.account_id.is_some_and(|a| accounts.contains(&a)))
            .cloned()
            .collect())
    }

    async fn followed_publishers(&self, account: i64) -> Result<Vec<i64>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .iter()
            .filter(|s| s.follower_id == account)
            .filter_map(|s| match s.target {
                SubscriptionTarget::Publisher(id) => Some(id),
                _ => None,
            })
            .collect())
    }

    async fn subscribers(&self, target: SubscriptionTarget) -> Result<Vec<i64>, StoreError> {
        let failing = self
            .failing_subscriber_lookups
            .lock()
            .map(|f| f.contains(&target))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Backend(format!("subscribers of {:?} unavailable", target)));
        }
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .iter()
            .filter(|s| s.target == target)
            .map(|s| s.follower_id)
            .collect())
    }

    async fn subscribe(&self, follower: i64, target: SubscriptionTarget) -> Result<Subscription, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.subscriptions.iter().any(|s| target_matches(s, follower, target)) {
            return Err(StoreError::Conflict("subscription already exists".to_string()));
        }
        let subscription = Subscription {
            id: tables.id(),
            follower_id: follower,
            target,
            created_at: Utc::now(),
        };
        tables.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn unsubscribe(&self, follower: i64, target: SubscriptionTarget) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let before = tables.subscriptions.len();
        tables.subscriptions.retain(|s| !target_matches(s, follower, target));
        if tables.subscriptions.len() == before {
            return Err(StoreError::NotFound("subscription not found".to_string()));
        }
        Ok(())
    }

    async fn categories_by_alias(&self, aliases: &[String]) -> Result<Vec<Category>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .categories
            .values()
            .filter(|c| aliases.contains(&c.alias))
            .cloned()
            .collect())
    }

    async fn tags_by_alias(&self, aliases: &[String]) -> Result<Vec<Tag>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.tags.values().filter(|t| aliases.contains(&t.alias)).cloned().collect())
    }

    async fn ensure_tags(&self, aliases: &[String]) -> Result<Vec<Tag>, StoreError> {
        let mut tables = self.tables.write().await;
        let mut out = Vec::with_capacity(aliases.len());
        for alias in aliases {
            if let Some(tag) = tables.tags.values().find(|t| &t.alias == alias) {
                out.push(tag.clone());
                continue;
            }
            let tag = Tag {
                id: tables.id(),
                alias: alias.clone(),
                name: alias.clone(),
                description: String::new(),
            };
            tables.tags.insert(tag.id, tag.clone());
            out.push(tag);
        }
        Ok(out)
    }

    async fn list_fediverse_posts(&self, limit: usize, before: Option<DateTime<Utc>>) -> Result<Vec<FediversePost>, StoreError> {
        let tables = self.tables.read().await;
        let mut found: Vec<FediversePost> = tables
            .fediverse
            .iter()
            .filter(|p| before.map_or(true, |b| p.created_at < b))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        found.truncate(limit);
        Ok(found)
    }
}
