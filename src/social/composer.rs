//! Post listing: the visibility predicate plus structural filters, executed
//! against the store and enriched with reaction and reply metrics.

use chrono::{DateTime, Duration, Utc};
use futures::future::join;
use log::warn;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::context::SocialContext;
use super::models::{Post, PostMetric, PostType};
use super::predicate::{publisher_in, Condition, Predicate};
use super::store::{ContentStore, Page, PostOrder, StoreError};
use super::views::ViewRecorder;
use super::visibility::{self, Channel, VisibilityScope};

pub const MAX_TAKE: usize = 100;
/// Reactions younger than this count towards the featured selection.
pub const FEATURED_WINDOW_DAYS: i64 = 7;
/// Best-scored posts considered before the viewer's visibility is applied.
const FEATURED_CANDIDATES: usize = 50;

pub fn filter_draft_state(predicate: Predicate) -> Predicate {
    predicate.and(Predicate::from(Condition::Draft).negate())
}

/// Drafts of the viewer's own publishers. Anonymous viewers have none.
pub fn filter_own_drafts(predicate: Predicate, viewer: Option<&SocialContext>) -> Predicate {
    let Some(ctx) = viewer else {
        return Predicate::False;
    };
    predicate
        .and(Condition::Draft)
        .and(publisher_in(ctx.own_publishers.iter().copied()))
}

/// Top-level posts only, or the direct replies of `reply_to`.
pub fn filter_reply_state(predicate: Predicate, reply_to: Option<i64>) -> Predicate {
    match reply_to {
        Some(parent) => predicate.and(Condition::ReplyTo(parent)),
        None => predicate.and(Predicate::from(Condition::Reply).negate()),
    }
}

pub fn filter_collapsed(predicate: Predicate) -> Predicate {
    predicate.and(Predicate::from(Condition::Collapsed).negate())
}

/// Hides posts scheduled after `as_of` or expired before it, except from their author.
pub fn filter_publication_window(predicate: Predicate, as_of: DateTime<Utc>, viewer: Option<&SocialContext>) -> Predicate {
    let in_window = Predicate::all([
        Predicate::from(Condition::ScheduledAfter(as_of)).negate(),
        Predicate::from(Condition::ExpiredBefore(as_of)).negate(),
    ]);
    let window = match viewer {
        Some(ctx) => publisher_in(ctx.own_publishers.iter().copied()).or(in_window),
        None => in_window,
    };
    predicate.and(window)
}

/// Posts in every one of `categories`.
pub fn filter_by_category(predicate: Predicate, categories: &[i64]) -> Predicate {
    predicate.and(Predicate::all(categories.iter().map(|&c| Condition::InCategory(c).into())))
}

/// Posts carrying every one of `tags`.
pub fn filter_by_tag(predicate: Predicate, tags: &[i64]) -> Predicate {
    predicate.and(Predicate::all(tags.iter().map(|&t| Condition::HasTag(t).into())))
}

pub fn filter_by_type(predicate: Predicate, post_type: PostType) -> Predicate {
    predicate.and(Condition::TypeIs(post_type))
}

pub fn filter_by_community(predicate: Predicate, realm: i64) -> Predicate {
    predicate.and(Condition::RealmIn([realm].into()))
}

pub fn filter_by_publisher(predicate: Predicate, publisher: i64) -> Predicate {
    predicate.and(publisher_in([publisher]))
}

pub fn filter_posted_before(predicate: Predicate, cursor: DateTime<Utc>) -> Predicate {
    predicate.and(Condition::PostedBefore(cursor))
}

pub fn filter_by_text(predicate: Predicate, probe: &str) -> Predicate {
    predicate.and(Condition::TextMatches(probe.to_string()))
}

pub fn filter_by_id(predicate: Predicate, id: i64) -> Predicate {
    predicate.and(Condition::IdIs(id))
}

pub fn filter_pinned(predicate: Predicate) -> Predicate {
    predicate.and(Condition::Pinned)
}

/// Policy for addressing one post directly. The post's own community counts as
/// explicitly requested, the same as a listing filtered to that community.
pub fn single_post_policy(viewer: Option<&SocialContext>, realm: Option<i64>, as_of: DateTime<Utc>) -> Predicate {
    let scope = realm.map(VisibilityScope::in_realm).unwrap_or_default();
    let base = visibility::build(viewer, &scope);
    let drafts = Predicate::any([filter_draft_state(base.clone()), filter_own_drafts(base, viewer)]);
    filter_publication_window(drafts, as_of, viewer)
}

#[derive(Clone, Debug, Default)]
pub struct PostQuery {
    pub channel: Option<Channel>,
    pub realm: Option<i64>,
    pub publisher: Option<i64>,
    pub categories: Vec<i64>,
    pub tags: Vec<i64>,
    pub post_type: Option<PostType>,
    /// When set, lists the replies of this post instead of top-level posts.
    pub reply_to: Option<i64>,
    /// Lists the viewer's own drafts instead of published posts.
    pub drafts: bool,
    pub probe: Option<String>,
    pub before: Option<DateTime<Utc>>,
    /// Only posts their publisher pinned.
    pub pinned: bool,
}

pub struct PostComposer {
    store: Arc<dyn ContentStore>,
    views: Option<ViewRecorder>,
}

impl PostComposer {
    pub fn new(store: Arc<dyn ContentStore>, views: Option<ViewRecorder>) -> Self {
        Self { store, views }
    }

    pub fn predicate_for(&self, viewer: Option<&SocialContext>, query: &PostQuery, as_of: DateTime<Utc>) -> Predicate {
        let scope = VisibilityScope {
            channel: query.channel,
            explicit_realm: query.realm,
        };
        let mut predicate = visibility::build(viewer, &scope);

        predicate = if query.drafts {
            filter_own_drafts(predicate, viewer)
        } else {
            filter_publication_window(filter_draft_state(predicate), as_of, viewer)
        };
        predicate = filter_collapsed(filter_reply_state(predicate, query.reply_to));

        if let Some(realm) = query.realm {
            predicate = filter_by_community(predicate, realm);
        }
        if let Some(publisher) = query.publisher {
            predicate = filter_by_publisher(predicate, publisher);
        }
        if let Some(post_type) = query.post_type {
            predicate = filter_by_type(predicate, post_type);
        }
        predicate = filter_by_tag(filter_by_category(predicate, &query.categories), &query.tags);
        if let Some(probe) = query.probe.as_deref() {
            predicate = filter_by_text(predicate, probe);
        }
        if let Some(cursor) = query.before {
            predicate = filter_posted_before(predicate, cursor);
        }
        if query.pinned {
            predicate = filter_pinned(predicate);
        }
        predicate
    }

    /// Runs `predicate` and attaches metrics. At most [`MAX_TAKE`] posts are returned.
    ///
    /// Metric lookups that fail leave zeroed metrics rather than failing the listing.
    pub async fn list(
        &self,
        viewer: Option<&SocialContext>,
        predicate: &Predicate,
        page: Page,
        order: PostOrder,
    ) -> Result<Vec<Post>, StoreError> {
        let page = Page::new(page.take.min(MAX_TAKE), page.offset);
        let posts = self.store.list_posts(predicate, page, order).await?;
        Ok(self.present(viewer, posts).await)
    }

    /// Published posts `viewer` may see with the best reaction balance of the
    /// last [`FEATURED_WINDOW_DAYS`] days, best first.
    pub async fn featured(
        &self,
        viewer: Option<&SocialContext>,
        take: usize,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Post>, StoreError> {
        let since = as_of - Duration::days(FEATURED_WINDOW_DAYS);
        let scores = self.store.reaction_scores(since, FEATURED_CANDIDATES).await?;
        if scores.is_empty() {
            return Ok(Vec::new());
        }
        let rank: HashMap<i64, usize> = scores.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();
        let predicate = self
            .predicate_for(viewer, &PostQuery::default(), as_of)
            .and(Condition::IdIn(rank.keys().copied().collect()));
        let mut posts = self
            .store
            .list_posts(&predicate, Page::new(scores.len(), 0), PostOrder::Published)
            .await?;
        posts.sort_by_key(|p| rank.get(&p.id).copied().unwrap_or(usize::MAX));
        posts.truncate(take.min(MAX_TAKE));
        Ok(self.present(viewer, posts).await)
    }

    async fn present(&self, viewer: Option<&SocialContext>, mut posts: Vec<Post>) -> Vec<Post> {
        if posts.is_empty() {
            return posts;
        }
        let ids: Vec<i64> = posts.iter().map(|p| p.id).collect();
        self.enrich(&mut posts, &ids).await;
        if let (Some(ctx), Some(views)) = (viewer, self.views.as_ref()) {
            views.record(ctx.account_id, &ids);
        }
        posts
    }

    pub async fn count(&self, predicate: &Predicate) -> Result<i64, StoreError> {
        self.store.count_posts(predicate).await
    }

    pub async fn enrich(&self, posts: &mut [Post], ids: &[i64]) {
        let (tallies, replies) = join(self.store.reaction_tallies(ids), self.store.reply_counts(ids)).await;
        let tallies = tallies.unwrap_or_else(|e| {
            warn!("Failed to load reaction tallies for {} posts: {}", ids.len(), e);
            HashMap::new()
        });
        let replies = replies.unwrap_or_else(|e| {
            warn!("Failed to load reply counts for {} posts: {}", ids.len(), e);
            HashMap::new()
        });

        for post in posts.iter_mut() {
            let reaction_list: BTreeMap<String, i64> = tallies.get(&post.id).cloned().unwrap_or_default();
            post.metric = Some(PostMetric {
                reaction_count: reaction_list.values().sum(),
                reaction_list,
                reply_count: replies.get(&post.id).copied().unwrap_or(0),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared::test_utils::{post, seeded_store};
    use crate::social::models::Attitude;
    use crate::social::store::{MemoryContentStore, NewReaction};
    use std::collections::BTreeSet;

    fn author_ctx() -> SocialContext {
        SocialContext {
            account_id: 100,
            own_publishers: BTreeSet::from([1]),
            ..Default::default()
        }
    }

    #[test]
    fn test_publication_window_hides_future_and_expired_posts_from_others() {
        let now = Utc::now();
        let mut scheduled = post(1, 1);
        scheduled.published_at = Some(now + Duration::hours(1));
        let mut expired = post(2, 1);
        expired.published_until = Some(now - Duration::hours(1));
        let current = post(3, 1);

        let others = filter_publication_window(Predicate::True, now, None);
        assert!(!others.matches(&scheduled));
        assert!(!others.matches(&expired));
        assert!(others.matches(&current));

        let own = filter_publication_window(Predicate::True, now, Some(&author_ctx()));
        assert!(own.matches(&scheduled));
        assert!(own.matches(&expired));
    }

    #[test]
    fn test_drafts_listing_is_author_scoped() {
        let mut draft = post(1, 1);
        draft.is_draft = true;
        let mut foreign = post(2, 9);
        foreign.is_draft = true;

        let composer = PostComposer::new(std::sync::Arc::new(crate::social::store::MemoryContentStore::new()), None);
        let query = PostQuery {
            drafts: true,
            ..Default::default()
        };
        let ctx = author_ctx();
        let predicate = composer.predicate_for(Some(&ctx), &query, Utc::now());
        assert!(predicate.matches(&draft));
        assert!(!predicate.matches(&foreign));
        assert_eq!(composer.predicate_for(None, &query, Utc::now()), Predicate::False);

        let published = composer.predicate_for(Some(&ctx), &PostQuery::default(), Utc::now());
        assert!(!published.matches(&draft));
    }

    #[test]
    fn test_filters_compose_in_any_order() {
        let mut p = post(1, 1);
        p.category_ids = vec![4, 5];
        p.tag_ids = vec![8];
        p.post_type = PostType::Article;

        let a = filter_by_tag(filter_by_type(filter_by_category(Predicate::True, &[4, 5]), PostType::Article), &[8]);
        let b = filter_by_category(filter_by_tag(filter_by_type(Predicate::True, PostType::Article), &[8]), &[4, 5]);
        assert!(a.matches(&p));
        assert!(b.matches(&p));
        assert!(!filter_by_category(Predicate::True, &[4, 6]).matches(&p));
        assert!(filter_by_category(Predicate::True, &[]).matches(&p));
    }

    #[test]
    fn test_reply_state() {
        let top = post(1, 1);
        let mut reply = post(2, 1);
        reply.reply_id = Some(1);
        assert!(filter_reply_state(Predicate::True, None).matches(&top));
        assert!(!filter_reply_state(Predicate::True, None).matches(&reply));
        assert!(filter_reply_state(Predicate::True, Some(1)).matches(&reply));
        assert!(!filter_reply_state(Predicate::True, Some(1)).matches(&top));
    }

    #[tokio::test]
    async fn test_list_enriches_with_reactions_and_replies() {
        let mut reply = post(3, 2);
        reply.reply_id = Some(1);
        let store = seeded_store(vec![post(1, 1), post(2, 1), reply]).await;
        for (account, symbol) in [(10, "thumb_up"), (11, "thumb_up"), (12, "heart")] {
            store
                .toggle_reaction(NewReaction {
                    symbol: symbol.to_string(),
                    attitude: Attitude::Positive,
                    post_id: 1,
                    account_id: account,
                })
                .await
                .unwrap();
        }

        let composer = PostComposer::new(store, None);
        let predicate = composer.predicate_for(None, &PostQuery::default(), Utc::now());
        let posts = composer
            .list(None, &predicate, Page::new(10, 0), PostOrder::Published)
            .await
            .unwrap();
        assert_eq!(posts.len(), 2);
        let first = posts.iter().find(|p| p.id == 1).unwrap();
        let metric = first.metric.as_ref().unwrap();
        assert_eq!(metric.reaction_count, 3);
        assert_eq!(metric.reaction_list.get("thumb_up"), Some(&2));
        assert_eq!(metric.reply_count, 1);
        assert_eq!(composer.count(&predicate).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_enrichment_failure_still_returns_posts() {
        let store = seeded_store(vec![post(1, 1), post(2, 1)]).await;
        store.set_enrichment_failure(true);
        let composer = PostComposer::new(store, None);
        let posts = composer
            .list(None, &Predicate::True, Page::new(10, 0), PostOrder::Published)
            .await
            .unwrap();
        assert_eq!(posts.len(), 2);
        assert!(posts.iter().all(|p| p.metric == Some(PostMetric::default())));
    }

    async fn react(store: &MemoryContentStore, post_id: i64, account_id: i64, attitude: Attitude) {
        store
            .toggle_reaction(NewReaction {
                symbol: "thumb".to_string(),
                attitude,
                post_id,
                account_id,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_featured_orders_by_reaction_balance_and_respects_visibility() {
        let mut hidden = post(4, 1);
        hidden.visibility = crate::social::models::Visibility::None;
        let store = seeded_store(vec![post(1, 1), post(2, 1), post(3, 1), hidden]).await;
        for account in 10..13 {
            react(&store, 2, account, Attitude::Positive).await;
            react(&store, 4, account, Attitude::Positive).await;
        }
        react(&store, 1, 10, Attitude::Positive).await;
        react(&store, 3, 10, Attitude::Positive).await;
        react(&store, 3, 11, Attitude::Negative).await;

        let composer = PostComposer::new(store, None);
        let featured = composer.featured(None, 3, Utc::now()).await.unwrap();
        let ids: Vec<i64> = featured.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(featured[0].metric.as_ref().map(|m| m.reaction_count), Some(3));

        let owner = composer.featured(Some(&author_ctx()), 1, Utc::now()).await.unwrap();
        assert_eq!(owner.iter().map(|p| p.id).collect::<Vec<_>>(), vec![4]);
    }

    #[tokio::test]
    async fn test_featured_ignores_old_reactions() {
        let store = seeded_store(vec![post(1, 1)]).await;
        react(&store, 1, 10, Attitude::Positive).await;
        let composer = PostComposer::new(store, None);
        let later = Utc::now() + Duration::days(FEATURED_WINDOW_DAYS + 1);
        assert!(composer.featured(None, 3, later).await.unwrap().is_empty());
    }

    #[test]
    fn test_single_post_policy_agrees_with_realm_listing() {
        let mut in_realm = post(1, 9);
        in_realm.realm_id = Some(7);
        let outsider = SocialContext {
            account_id: 300,
            ..Default::default()
        };
        let composer = PostComposer::new(std::sync::Arc::new(MemoryContentStore::new()), None);
        let listing = composer.predicate_for(
            Some(&outsider),
            &PostQuery {
                realm: Some(7),
                ..Default::default()
            },
            Utc::now(),
        );
        assert!(listing.matches(&in_realm));
        assert!(single_post_policy(Some(&outsider), Some(7), Utc::now()).matches(&in_realm));
        assert!(!single_post_policy(None, Some(7), Utc::now()).matches(&in_realm));

        let mut draft = post(2, 1);
        draft.is_draft = true;
        assert!(single_post_policy(Some(&author_ctx()), None, Utc::now()).matches(&draft));
        assert!(!single_post_policy(Some(&outsider), None, Utc::now()).matches(&draft));
    }

    #[test]
    fn test_pinned_listing() {
        let mut pinned = post(1, 1);
        pinned.pinned_at = Some(Utc::now());
        let plain = post(2, 1);
        let composer = PostComposer::new(std::sync::Arc::new(MemoryContentStore::new()), None);
        let query = PostQuery {
            publisher: Some(1),
            pinned: true,
            ..Default::default()
        };
        let predicate = composer.predicate_for(None, &query, Utc::now());
        assert!(predicate.matches(&pinned));
        assert!(!predicate.matches(&plain));
    }

    #[tokio::test]
    async fn test_take_is_capped() {
        let store = seeded_store((1..=120).map(|id| post(id, 1)).collect()).await;
        let composer = PostComposer::new(store, None);
        let posts = composer
            .list(None, &Predicate::True, Page::new(500, 0), PostOrder::Published)
            .await
            .unwrap();
        assert_eq!(posts.len(), MAX_TAKE);
    }
}
