use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Timestamptz};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::sql::{lower, posted_at, rank_score};
use super::{ContentStore, FlagTally, NewReaction, Page, PostOrder, StoreError};
use crate::core::shared::schema::{
    categories, fediverse_posts, fediverse_users, post_categories, post_flags, post_tags, post_views, posts,
    publishers, reactions, subscriptions, tags,
};
use crate::core::shared::utils::DbPool;
use crate::social::models::{
    Attitude, Category, FediversePost, FediverseUser, Post, PostType, Publisher, PublisherType, Reaction,
    ReactionToggle, Subscription, SubscriptionTarget, Tag, Visibility,
};
use crate::social::predicate::Predicate;
use crate::social::views::ViewBatch;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = posts)]
#[diesel(check_for_backend(Pg))]
struct DbPost {
    id: i64,
    post_type: String,
    body: Value,
    language: String,
    alias: Option<String>,
    alias_prefix: Option<String>,
    visibility: i16,
    visible_users: Vec<i64>,
    invisible_users: Vec<i64>,
    realm_id: Option<i64>,
    is_draft: bool,
    published_at: Option<DateTime<Utc>>,
    published_until: Option<DateTime<Utc>>,
    reply_id: Option<i64>,
    repost_id: Option<i64>,
    total_upvote: i32,
    total_downvote: i32,
    total_views: i64,
    total_aggressive_views: i64,
    is_collapsed: bool,
    locked_at: Option<DateTime<Utc>>,
    pinned_at: Option<DateTime<Utc>>,
    edited_at: Option<DateTime<Utc>>,
    publisher_id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl DbPost {
    fn into_post(self, category_ids: Vec<i64>, tag_ids: Vec<i64>) -> Result<Post, StoreError> {
        Ok(Post {
            id: self.id,
            post_type: self.post_type.parse::<PostType>().map_err(StoreError::Backend)?,
            body: self.body,
            language: self.language,
            alias: self.alias,
            alias_prefix: self.alias_prefix,
            visibility: Visibility::try_from(self.visibility).map_err(StoreError::Backend)?,
            visible_users: self.visible_users,
            invisible_users: self.invisible_users,
            realm_id: self.realm_id,
            is_draft: self.is_draft,
            published_at: self.published_at,
            published_until: self.published_until,
            reply_id: self.reply_id,
            repost_id: self.repost_id,
            total_upvote: self.total_upvote,
            total_downvote: self.total_downvote,
            total_views: self.total_views,
            total_aggressive_views: self.total_aggressive_views,
            is_collapsed: self.is_collapsed,
            locked_at: self.locked_at,
            pinned_at: self.pinned_at,
            edited_at: self.edited_at,
            publisher_id: self.publisher_id,
            category_ids,
            tag_ids,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            metric: None,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = posts)]
struct NewDbPost {
    post_type: String,
    body: Value,
    language: String,
    alias: Option<String>,
    alias_prefix: Option<String>,
    visibility: i16,
    visible_users: Vec<i64>,
    invisible_users: Vec<i64>,
    realm_id: Option<i64>,
    is_draft: bool,
    published_at: Option<DateTime<Utc>>,
    published_until: Option<DateTime<Utc>>,
    reply_id: Option<i64>,
    repost_id: Option<i64>,
    locked_at: Option<DateTime<Utc>>,
    pinned_at: Option<DateTime<Utc>>,
    publisher_id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = posts, treat_none_as_null = true)]
struct PostChanges {
    post_type: String,
    body: Value,
    language: String,
    alias: Option<String>,
    alias_prefix: Option<String>,
    visibility: i16,
    visible_users: Vec<i64>,
    invisible_users: Vec<i64>,
    realm_id: Option<i64>,
    is_draft: bool,
    published_at: Option<DateTime<Utc>>,
    published_until: Option<DateTime<Utc>>,
    locked_at: Option<DateTime<Utc>>,
    pinned_at: Option<DateTime<Utc>>,
    edited_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<&Post> for PostChanges {
    fn from(p: &Post) -> Self {
        Self {
            post_type: p.post_type.as_str().to_string(),
            body: p.body.clone(),
            language: p.language.clone(),
            alias: p.alias.clone(),
            alias_prefix: p.alias_prefix.clone(),
            visibility: p.visibility.as_i16(),
            visible_users: p.visible_users.clone(),
            invisible_users: p.invisible_users.clone(),
            realm_id: p.realm_id,
            is_draft: p.is_draft,
            published_at: p.published_at,
            published_until: p.published_until,
            locked_at: p.locked_at,
            pinned_at: p.pinned_at,
            edited_at: p.edited_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = publishers)]
#[diesel(check_for_backend(Pg))]
struct DbPublisher {
    id: i64,
    publisher_type: i16,
    name: String,
    nick: String,
    description: String,
    realm_id: Option<i64>,
    account_id: Option<i64>,
}

impl TryFrom<DbPublisher> for Publisher {
    type Error = StoreError;

    fn try_from(row: DbPublisher) -> Result<Self, Self::Error> {
        Ok(Publisher {
            id: row.id,
            publisher_type: PublisherType::try_from(row.publisher_type).map_err(StoreError::Backend)?,
            name: row.name,
            nick: row.nick,
            description: row.description,
            realm_id: row.realm_id,
            account_id: row.account_id,
        })
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = reactions)]
#[diesel(check_for_backend(Pg))]
struct DbReaction {
    id: i64,
    symbol: String,
    attitude: i16,
    post_id: i64,
    account_id: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, QueryableByName)]
struct ScoreRow {
    #[diesel(sql_type = BigInt)]
    post_id: i64,
    #[diesel(sql_type = BigInt)]
    points: i64,
}

#[derive(Insertable)]
#[diesel(table_name = reactions)]
struct NewDbReaction<'a> {
    symbol: &'a str,
    attitude: i16,
    post_id: i64,
    account_id: i64,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = subscriptions)]
#[diesel(check_for_backend(Pg))]
struct DbSubscription {
    id: i64,
    follower_id: i64,
    publisher_id: Option<i64>,
    tag_id: Option<i64>,
    category_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DbSubscription> for Subscription {
    type Error = StoreError;

    fn try_from(row: DbSubscription) -> Result<Self, Self::Error> {
        let target = match (row.publisher_id, row.tag_id, row.category_id) {
            (Some(id), None, None) => SubscriptionTarget::Publisher(id),
            (None, Some(id), None) => SubscriptionTarget::Tag(id),
            (None, None, Some(id)) => SubscriptionTarget::Category(id),
            _ => return Err(StoreError::Backend(format!("subscription {} has no single target", row.id))),
        };
        Ok(Subscription {
            id: row.id,
            follower_id: row.follower_id,
            target,
            created_at: row.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = subscriptions)]
struct NewDbSubscription {
    follower_id: i64,
    publisher_id: Option<i64>,
    tag_id: Option<i64>,
    category_id: Option<i64>,
}

impl NewDbSubscription {
    fn new(follower_id: i64, target: SubscriptionTarget) -> Self {
        let (publisher_id, tag_id, category_id) = target_columns(target);
        Self {
            follower_id,
            publisher_id,
            tag_id,
            category_id,
        }
    }
}

fn target_columns(target: SubscriptionTarget) -> (Option<i64>, Option<i64>, Option<i64>) {
    match target {
        SubscriptionTarget::Publisher(id) => (Some(id), None, None),
        SubscriptionTarget::Tag(id) => (None, Some(id), None),
        SubscriptionTarget::Category(id) => (None, None, Some(id)),
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = fediverse_posts)]
#[diesel(check_for_backend(Pg))]
struct DbFediversePost {
    id: i64,
    identifier: String,
    origin: String,
    content: String,
    language: String,
    images: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = fediverse_users)]
#[diesel(check_for_backend(Pg))]
struct DbFediverseUser {
    id: i64,
    identifier: String,
    origin: String,
    name: String,
    nick: String,
    avatar: String,
}

fn load_links(conn: &mut PgConnection, ids: &[i64]) -> QueryResult<(HashMap<i64, Vec<i64>>, HashMap<i64, Vec<i64>>)> {
    let mut cats: HashMap<i64, Vec<i64>> = HashMap::new();
    for (post_id, category_id) in post_categories::table
        .filter(post_categories::post_id.eq_any(ids))
        .select((post_categories::post_id, post_categories::category_id))
        .load::<(i64, i64)>(conn)?
    {
        cats.entry(post_id).or_default().push(category_id);
    }
    let mut tag_links: HashMap<i64, Vec<i64>> = HashMap::new();
    for (post_id, tag_id) in post_tags::table
        .filter(post_tags::post_id.eq_any(ids))
        .select((post_tags::post_id, post_tags::tag_id))
        .load::<(i64, i64)>(conn)?
    {
        tag_links.entry(post_id).or_default().push(tag_id);
    }
    Ok((cats, tag_links))
}

fn with_links(conn: &mut PgConnection, rows: Vec<DbPost>) -> Result<Vec<Post>, StoreError> {
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let (mut cats, mut tag_links) = load_links(conn, &ids)?;
    rows.into_iter()
        .map(|row| {
            let id = row.id;
            row.into_post(cats.remove(&id).unwrap_or_default(), tag_links.remove(&id).unwrap_or_default())
        })
        .collect()
}

fn replace_links(conn: &mut PgConnection, post: &Post) -> QueryResult<()> {
    diesel::delete(post_categories::table.filter(post_categories::post_id.eq(post.id))).execute(conn)?;
    diesel::delete(post_tags::table.filter(post_tags::post_id.eq(post.id))).execute(conn)?;
    let cat_rows: Vec<_> = post
        .category_ids
        .iter()
        .map(|c| (post_categories::post_id.eq(post.id), post_categories::category_id.eq(*c)))
        .collect();
    diesel::insert_into(post_categories::table)
        .values(cat_rows)
        .on_conflict_do_nothing()
        .execute(conn)?;
    let tag_rows: Vec<_> = post
        .tag_ids
        .iter()
        .map(|t| (post_tags::post_id.eq(post.id), post_tags::tag_id.eq(*t)))
        .collect();
    diesel::insert_into(post_tags::table)
        .values(tag_rows)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

fn adjust_votes(conn: &mut PgConnection, post_id: i64, attitude: Attitude, delta: i32) -> QueryResult<()> {
    let target = posts::table.find(post_id);
    match attitude {
        Attitude::Positive => {
            diesel::update(target)
                .set(posts::total_upvote.eq(posts::total_upvote + delta))
                .execute(conn)?;
        }
        Attitude::Negative => {
            diesel::update(target)
                .set(posts::total_downvote.eq(posts::total_downvote + delta))
                .execute(conn)?;
        }
        Attitude::Neutral => {}
    }
    Ok(())
}

fn conflict_as(message: &'static str) -> impl Fn(diesel::result::Error) -> StoreError {
    move |e| match StoreError::from(e) {
        StoreError::Conflict(_) => StoreError::Conflict(message.to_string()),
        other => other,
    }
}

pub struct PgContentStore {
    pool: DbPool,
}

impl PgContentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.run(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn list_posts(&self, predicate: &Predicate, page: Page, order: PostOrder) -> Result<Vec<Post>, StoreError> {
        let predicate = predicate.clone();
        self.run(move |conn| {
            let query = posts::table
                .filter(posts::deleted_at.is_null())
                .filter(lower(&predicate))
                .select(DbPost::as_select())
                .into_boxed();
            let query = match order {
                PostOrder::Published => query.order((posted_at().desc(), posts::id.desc())),
                PostOrder::Ranked { now } => query.order((rank_score(now).desc(), posts::id.desc())),
            };
            let rows = query
                .limit(page.take as i64)
                .offset(page.offset as i64)
                .load::<DbPost>(conn)?;
            with_links(conn, rows)
        })
        .await
    }

    async fn count_posts(&self, predicate: &Predicate) -> Result<i64, StoreError> {
        let predicate = predicate.clone();
        self.run(move |conn| {
            Ok(posts::table
                .filter(posts::deleted_at.is_null())
                .filter(lower(&predicate))
                .count()
                .get_result::<i64>(conn)?)
        })
        .await
    }

    async fn get_post(&self, id: i64) -> Result<Option<Post>, StoreError> {
        self.run(move |conn| {
            let row = posts::table
                .filter(posts::id.eq(id))
                .filter(posts::deleted_at.is_null())
                .select(DbPost::as_select())
                .first::<DbPost>(conn)
                .optional()?;
            match row {
                Some(row) => Ok(with_links(conn, vec![row])?.pop()),
                None => Ok(None),
            }
        })
        .await
    }

    async fn insert_post(&self, post: Post) -> Result<Post, StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let row = NewDbPost {
                    post_type: post.post_type.as_str().to_string(),
                    body: post.body.clone(),
                    language: post.language.clone(),
                    alias: post.alias.clone(),
                    alias_prefix: post.alias_prefix.clone(),
                    visibility: post.visibility.as_i16(),
                    visible_users: post.visible_users.clone(),
                    invisible_users: post.invisible_users.clone(),
                    realm_id: post.realm_id,
                    is_draft: post.is_draft,
                    published_at: post.published_at,
                    published_until: post.published_until,
                    reply_id: post.reply_id,
                    repost_id: post.repost_id,
                    locked_at: post.locked_at,
                    pinned_at: post.pinned_at,
                    publisher_id: post.publisher_id,
                    created_at: post.created_at,
                    updated_at: post.updated_at,
                };
                let stored: DbPost = diesel::insert_into(posts::table)
                    .values(&row)
                    .returning(DbPost::as_returning())
                    .get_result(conn)
                    .map_err(conflict_as("alias already in use"))?;
                let saved = stored.into_post(post.category_ids.clone(), post.tag_ids.clone())?;
                replace_links(conn, &saved)?;
                Ok(saved)
            })
        })
        .await
    }

    async fn update_post(&self, post: &Post) -> Result<Post, StoreError> {
        let post = post.clone();
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let stored: DbPost = diesel::update(
                    posts::table
                        .filter(posts::id.eq(post.id))
                        .filter(posts::deleted_at.is_null()),
                )
                .set(PostChanges::from(&post))
                .returning(DbPost::as_returning())
                .get_result(conn)
                .optional()
                .map_err(conflict_as("alias already in use"))?
                .ok_or_else(|| StoreError::NotFound(format!("post {} not found", post.id)))?;
                let saved = stored.into_post(post.category_ids.clone(), post.tag_ids.clone())?;
                replace_links(conn, &saved)?;
                Ok(saved)
            })
        })
        .await
    }

    async fn soft_delete_post(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.run(move |conn| {
            let affected = diesel::update(
                posts::table
                    .filter(posts::id.eq(id))
                    .filter(posts::deleted_at.is_null()),
            )
            .set(posts::deleted_at.eq(Some(at)))
            .execute(conn)?;
            if affected == 0 {
                return Err(StoreError::NotFound(format!("post {} not found", id)));
            }
            Ok(())
        })
        .await
    }

    async fn purge_deleted(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.run(move |conn| Ok(diesel::delete(posts::table.filter(posts::deleted_at.lt(before))).execute(conn)?))
            .await
    }

    async fn reaction_tallies(&self, post_ids: &[i64]) -> Result<HashMap<i64, BTreeMap<String, i64>>, StoreError> {
        let ids = post_ids.to_vec();
        self.run(move |conn| {
            let rows = reactions::table
                .filter(reactions::post_id.eq_any(&ids))
                .group_by((reactions::post_id, reactions::symbol))
                .select((reactions::post_id, reactions::symbol, count_star()))
                .load::<(i64, String, i64)>(conn)?;
            let mut out: HashMap<i64, BTreeMap<String, i64>> = HashMap::new();
            for (post_id, symbol, count) in rows {
                out.entry(post_id).or_default().insert(symbol, count);
            }
            Ok(out)
        })
        .await
    }

    async fn reply_counts(&self, post_ids: &[i64]) -> Result<HashMap<i64, i64>, StoreError> {
        let ids = post_ids.to_vec();
        self.run(move |conn| {
            let rows = posts::table
                .filter(posts::deleted_at.is_null())
                .filter(posts::reply_id.is_not_null())
                .filter(posts::reply_id.assume_not_null().eq_any(&ids))
                .group_by(posts::reply_id)
                .select((posts::reply_id.assume_not_null(), count_star()))
                .load::<(i64, i64)>(conn)?;
            Ok(rows.into_iter().collect())
        })
        .await
    }

    async fn reaction_scores(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<(i64, i64)>, StoreError> {
        self.run(move |conn| {
            let rows = diesel::sql_query(
                "SELECT post_id, SUM(CASE attitude WHEN 1 THEN 1 WHEN 2 THEN -1 ELSE 0 END)::int8 AS points \
                 FROM reactions WHERE created_at >= $1 \
                 GROUP BY post_id \
                 HAVING SUM(CASE attitude WHEN 1 THEN 1 WHEN 2 THEN -1 ELSE 0 END) > 0 \
                 ORDER BY points DESC, post_id DESC \
                 LIMIT $2",
            )
            .bind::<Timestamptz, _>(since)
            .bind::<BigInt, _>(limit as i64)
            .load::<ScoreRow>(conn)?;
            Ok(rows.into_iter().map(|r| (r.post_id, r.points)).collect())
        })
        .await
    }

    async fn toggle_reaction(&self, reaction: NewReaction) -> Result<ReactionToggle, StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let exists = posts::table
                    .filter(posts::id.eq(reaction.post_id))
                    .filter(posts::deleted_at.is_null())
                    .select(posts::id)
                    .first::<i64>(conn)
                    .optional()?;
                if exists.is_none() {
                    return Err(StoreError::NotFound(format!("post {} not found", reaction.post_id)));
                }

                let existing = reactions::table
                    .filter(reactions::post_id.eq(reaction.post_id))
                    .filter(reactions::account_id.eq(reaction.account_id))
                    .filter(reactions::symbol.eq(&reaction.symbol))
                    .select(DbReaction::as_select())
                    .first::<DbReaction>(conn)
                    .optional()?;

                match existing {
                    Some(row) => {
                        diesel::delete(reactions::table.find(row.id)).execute(conn)?;
                        let attitude = Attitude::try_from(row.attitude).map_err(StoreError::Backend)?;
                        adjust_votes(conn, reaction.post_id, attitude, -1)?;
                        Ok(ReactionToggle::Removed)
                    }
                    None => {
                        let row: DbReaction = diesel::insert_into(reactions::table)
                            .values(NewDbReaction {
                                symbol: &reaction.symbol,
                                attitude: reaction.attitude.into(),
                                post_id: reaction.post_id,
                                account_id: reaction.account_id,
                            })
                            .returning(DbReaction::as_returning())
                            .get_result(conn)?;
                        adjust_votes(conn, reaction.post_id, reaction.attitude, 1)?;
                        Ok(ReactionToggle::Added(Reaction {
                            id: row.id,
                            symbol: row.symbol,
                            attitude: reaction.attitude,
                            post_id: row.post_id,
                            account_id: row.account_id,
                            created_at: row.created_at,
                        }))
                    }
                }
            })
        })
        .await
    }

    async fn add_flag(&self, post_id: i64, account_id: i64) -> Result<FlagTally, StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let total_views = posts::table
                    .filter(posts::id.eq(post_id))
                    .filter(posts::deleted_at.is_null())
                    .select(posts::total_views)
                    .first::<i64>(conn)
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(format!("post {} not found", post_id)))?;
                diesel::insert_into(post_flags::table)
                    .values((post_flags::post_id.eq(post_id), post_flags::account_id.eq(account_id)))
                    .execute(conn)
                    .map_err(conflict_as("flag already exists"))?;
                let flags = post_flags::table
                    .filter(post_flags::post_id.eq(post_id))
                    .count()
                    .get_result::<i64>(conn)?;
                Ok(FlagTally { flags, total_views })
            })
        })
        .await
    }

    async fn set_collapsed(&self, post_id: i64, collapsed: bool) -> Result<(), StoreError> {
        self.run(move |conn| {
            diesel::update(posts::table.find(post_id))
                .set(posts::is_collapsed.eq(collapsed))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn apply_view_batch(&self, batch: &ViewBatch) -> Result<(), StoreError> {
        let batch = batch.clone();
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let live: Vec<i64> = posts::table
                    .filter(posts::id.eq_any(batch.impressions.keys().copied().collect::<Vec<_>>()))
                    .select(posts::id)
                    .load(conn)?;
                let rows: Vec<_> = batch
                    .unique
                    .iter()
                    .filter(|v| live.contains(&v.post_id))
                    .map(|v| (post_views::post_id.eq(v.post_id), post_views::account_id.eq(v.account_id)))
                    .collect();
                diesel::insert_into(post_views::table)
                    .values(rows)
                    .on_conflict_do_nothing()
                    .execute(conn)?;

                for (&post_id, &impressions) in batch.impressions.iter().filter(|(id, _)| live.contains(id)) {
                    let unique = post_views::table
                        .filter(post_views::post_id.eq(post_id))
                        .count()
                        .get_result::<i64>(conn)?;
                    diesel::update(posts::table.find(post_id))
                        .set((
                            posts::total_views.eq(unique),
                            posts::total_aggressive_views.eq(posts::total_aggressive_views + impressions),
                        ))
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn publisher(&self, id: i64) -> Result<Option<Publisher>, StoreError> {
        self.run(move |conn| {
            publishers::table
                .filter(publishers::id.eq(id))
                .filter(publishers::deleted_at.is_null())
                .select(DbPublisher::as_select())
                .first::<DbPublisher>(conn)
                .optional()?
                .map(Publisher::try_from)
                .transpose()
        })
        .await
    }

    async fn publisher_by_name(&self, name: &str) -> Result<Option<Publisher>, StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            publishers::table
                .filter(publishers::name.eq(&name))
                .filter(publishers::deleted_at.is_null())
                .select(DbPublisher::as_select())
                .first::<DbPublisher>(conn)
                .optional()?
                .map(Publisher::try_from)
                .transpose()
        })
        .await
    }

    async fn publishers_of_accounts(&self, accounts: &[i64]) -> Result<Vec<Publisher>, StoreError> {
        let accounts = accounts.to_vec();
        self.run(move |conn| {
            publishers::table
                .filter(publishers::account_id.is_not_null())
                .filter(publishers::account_id.assume_not_null().eq_any(&accounts))
                .filter(publishers::deleted_at.is_null())
                .select(DbPublisher::as_select())
                .load::<DbPublisher>(conn)?
                .into_iter()
                .map(Publisher::try_from)
                .collect()
        })
        .await
    }

    async fn followed_publishers(&self, account: i64) -> Result<Vec<i64>, StoreError> {
        self.run(move |conn| {
            Ok(subscriptions::table
                .filter(subscriptions::follower_id.eq(account))
                .filter(subscriptions::publisher_id.is_not_null())
                .select(subscriptions::publisher_id.assume_not_null())
                .load::<i64>(conn)?)
        })
        .await
    }

    async fn subscribers(&self, target: SubscriptionTarget) -> Result<Vec<i64>, StoreError> {
        self.run(move |conn| {
            let query = subscriptions::table.select(subscriptions::follower_id).into_boxed();
            let query = match target {
                SubscriptionTarget::Publisher(id) => query.filter(subscriptions::publisher_id.eq(id)),
                SubscriptionTarget::Tag(id) => query.filter(subscriptions::tag_id.eq(id)),
                SubscriptionTarget::Category(id) => query.filter(subscriptions::category_id.eq(id)),
            };
            Ok(query.load::<i64>(conn)?)
        })
        .await
    }

    async fn subscribe(&self, follower: i64, target: SubscriptionTarget) -> Result<Subscription, StoreError> {
        self.run(move |conn| {
            let row: DbSubscription = diesel::insert_into(subscriptions::table)
                .values(NewDbSubscription::new(follower, target))
                .returning(DbSubscription::as_returning())
                .get_result(conn)
                .map_err(conflict_as("subscription already exists"))?;
            Subscription::try_from(row)
        })
        .await
    }

    async fn unsubscribe(&self, follower: i64, target: SubscriptionTarget) -> Result<(), StoreError> {
        self.run(move |conn| {
            let scoped = subscriptions::table.filter(subscriptions::follower_id.eq(follower));
            let affected = match target {
                SubscriptionTarget::Publisher(id) => {
                    diesel::delete(scoped.filter(subscriptions::publisher_id.eq(id))).execute(conn)?
                }
                SubscriptionTarget::Tag(id) => diesel::delete(scoped.filter(subscriptions::tag_id.eq(id))).execute(conn)?,
                SubscriptionTarget::Category(id) => {
                    diesel::delete(scoped.filter(subscriptions::category_id.eq(id))).execute(conn)?
                }
            };
            if affected == 0 {
                return Err(StoreError::NotFound("subscription not found".to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn categories_by_alias(&self, aliases: &[String]) -> Result<Vec<Category>, StoreError> {
        let aliases = aliases.to_vec();
        self.run(move |conn| {
            let rows = categories::table
                .filter(categories::alias.eq_any(&aliases))
                .select((categories::id, categories::alias, categories::name, categories::description))
                .load::<(i64, String, String, String)>(conn)?;
            Ok(rows
                .into_iter()
                .map(|(id, alias, name, description)| Category {
                    id,
                    alias,
                    name,
                    description,
                })
                .collect())
        })
        .await
    }

    async fn tags_by_alias(&self, aliases: &[String]) -> Result<Vec<Tag>, StoreError> {
        let aliases = aliases.to_vec();
        self.run(move |conn| {
            let rows = tags::table
                .filter(tags::alias.eq_any(&aliases))
                .select((tags::id, tags::alias, tags::name, tags::description))
                .load::<(i64, String, String, String)>(conn)?;
            Ok(rows
                .into_iter()
                .map(|(id, alias, name, description)| Tag {
                    id,
                    alias,
                    name,
                    description,
                })
                .collect())
        })
        .await
    }

    async fn ensure_tags(&self, aliases: &[String]) -> Result<Vec<Tag>, StoreError> {
        let missing: Vec<_> = aliases
            .iter()
            .map(|a| (tags::alias.eq(a.clone()), tags::name.eq(a.clone())))
            .collect();
        let aliases = aliases.to_vec();
        self.run(move |conn| {
            diesel::insert_into(tags::table)
                .values(missing)
                .on_conflict(tags::alias)
                .do_nothing()
                .execute(conn)?;
            Ok(())
        })
        .await?;
        self.tags_by_alias(&aliases).await
    }

    async fn list_fediverse_posts(&self, limit: usize, before: Option<DateTime<Utc>>) -> Result<Vec<FediversePost>, StoreError> {
        self.run(move |conn| {
            let mut query = fediverse_posts::table
                .inner_join(fediverse_users::table)
                .select((DbFediversePost::as_select(), DbFediverseUser::as_select()))
                .into_boxed();
            if let Some(before) = before {
                query = query.filter(fediverse_posts::created_at.lt(before));
            }
            let rows = query
                .order((fediverse_posts::created_at.desc(), fediverse_posts::id.desc()))
                .limit(limit as i64)
                .load::<(DbFediversePost, DbFediverseUser)>(conn)?;
            Ok(rows
                .into_iter()
                .map(|(p, u)| FediversePost {
                    id: p.id,
                    identifier: p.identifier,
                    origin: p.origin,
                    content: p.content,
                    language: p.language,
                    images: p.images,
                    user: FediverseUser {
                        id: u.id,
                        identifier: u.identifier,
                        origin: u.origin,
                        name: u.name,
                        nick: u.nick,
                        avatar: u.avatar,
                    },
                    created_at: p.created_at,
                })
                .collect())
        })
        .await
    }
}
