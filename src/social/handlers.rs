use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::composer::{filter_by_id, single_post_policy, PostQuery};
use super::context::SocialContext;
use super::feed::FeedPage;
use super::lifecycle::{truncate_post_content, PostRequest};
use super::models::{Attitude, Post, PostType, Publisher, PublisherType, ReactionToggle, Subscription, SubscriptionTarget};
use super::predicate::{Condition, Predicate};
use super::store::{Page, PostOrder};
use super::visibility::Channel;
use super::SocialError;
use crate::core::shared::state::AppState;

/// Header the gateway sets to the authenticated account id.
pub const ACCOUNT_HEADER: &str = "x-account-id";
/// Header carrying the shared secret of internal callers.
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";
const DEFAULT_TAKE: usize = 20;
const DEFAULT_FEED_LIMIT: usize = 20;
const DEFAULT_FEATURED: usize = 3;
const MAX_FEATURED: usize = 10;

/// The calling account, if the request is authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewer(pub Option<i64>);

impl Viewer {
    pub fn require(&self) -> Result<i64, SocialError> {
        self.0
            .ok_or_else(|| SocialError::Unauthorized("authentication is required".to_string()))
    }
}

impl<S> FromRequestParts<S> for Viewer
where
    S: Send + Sync,
{
    type Rejection = SocialError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(raw) = parts.headers.get(ACCOUNT_HEADER) else {
            return Ok(Viewer(None));
        };
        raw.to_str()
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(|id| Viewer(Some(id)))
            .ok_or_else(|| SocialError::Unauthorized("invalid account header".to_string()))
    }
}

/// A caller that presented the configured internal token.
#[derive(Clone, Copy, Debug)]
pub struct InternalCaller;

impl FromRequestParts<Arc<AppState>> for InternalCaller {
    type Rejection = SocialError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.internal_token.as_deref() else {
            return Err(SocialError::Forbidden("internal routes are disabled".to_string()));
        };
        let given = parts
            .headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SocialError::Unauthorized("internal token is required".to_string()))?;
        if !tokens_match(given.as_bytes(), expected.as_bytes()) {
            return Err(SocialError::Forbidden("invalid internal token".to_string()));
        }
        Ok(InternalCaller)
    }
}

fn tokens_match(given: &[u8], expected: &[u8]) -> bool {
    given.len() == expected.len() && given.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

async fn context_of(state: &AppState, viewer: Viewer) -> Result<Option<SocialContext>, SocialError> {
    match viewer.0 {
        Some(account) => Ok(Some(state.resolver.resolve(account).await?)),
        None => Ok(None),
    }
}

fn split_aliases(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
pub struct ListPostsQuery {
    pub take: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub truncate: bool,
    pub realm: Option<String>,
    pub channel: Option<Channel>,
    #[serde(rename = "type")]
    pub post_type: Option<PostType>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub author: Option<String>,
    pub probe: Option<String>,
}

async fn build_query(state: &AppState, params: &ListPostsQuery) -> Result<PostQuery, SocialError> {
    let mut query = PostQuery {
        channel: params.channel,
        post_type: params.post_type,
        probe: params.probe.clone(),
        ..Default::default()
    };

    if let Some(realm) = params.realm.as_deref().filter(|r| !r.is_empty()) {
        query.realm = Some(match realm.parse::<i64>() {
            Ok(id) => id,
            Err(_) => state
                .communities
                .resolve_alias(realm)
                .await
                .map_err(|e| SocialError::Internal(format!("failed to resolve realm: {}", e)))?
                .ok_or_else(|| SocialError::NotFound(format!("realm {} was not found", realm)))?,
        });
    }

    if let Some(author) = params.author.as_deref().filter(|a| !a.is_empty()) {
        let publisher = state
            .store
            .publisher_by_name(author)
            .await?
            .ok_or_else(|| SocialError::NotFound(format!("publisher {} was not found", author)))?;
        query.publisher = Some(publisher.id);
    }

    let categories = split_aliases(params.category.as_deref());
    if !categories.is_empty() {
        let found = state.store.categories_by_alias(&categories).await?;
        if found.len() < categories.len() {
            return Err(SocialError::NotFound("category was not found".to_string()));
        }
        query.categories = found.iter().map(|c| c.id).collect();
    }

    let tags = split_aliases(params.tag.as_deref());
    if !tags.is_empty() {
        let found = state.store.tags_by_alias(&tags).await?;
        if found.len() < tags.len() {
            return Err(SocialError::NotFound("tag was not found".to_string()));
        }
        query.tags = found.iter().map(|t| t.id).collect();
    }
    Ok(query)
}

async fn run_listing(
    state: &AppState,
    ctx: Option<&SocialContext>,
    query: &PostQuery,
    params: &ListPostsQuery,
) -> Result<Json<Value>, SocialError> {
    let predicate = state.composer.predicate_for(ctx, query, Utc::now());
    let take = params.take.unwrap_or(DEFAULT_TAKE);
    let page = Page::new(take, params.offset.unwrap_or(0));
    let (count, mut posts) = tokio::try_join!(
        state.composer.count(&predicate),
        state.composer.list(ctx, &predicate, page, PostOrder::Published),
    )?;
    if params.truncate {
        posts.iter_mut().for_each(truncate_post_content);
    }
    Ok(Json(json!({ "count": count, "data": posts })))
}

pub async fn handle_list_posts(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(params): Query<ListPostsQuery>,
) -> Result<Json<Value>, SocialError> {
    let ctx = context_of(&state, viewer).await?;
    let query = build_query(&state, &params).await?;
    run_listing(&state, ctx.as_ref(), &query, &params).await
}

pub async fn handle_search_posts(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(params): Query<ListPostsQuery>,
) -> Result<Json<Value>, SocialError> {
    if params.probe.as_deref().map_or(true, |p| p.trim().is_empty()) {
        return Err(SocialError::BadRequest("probe is required".to_string()));
    }
    let ctx = context_of(&state, viewer).await?;
    let query = build_query(&state, &params).await?;
    run_listing(&state, ctx.as_ref(), &query, &params).await
}

pub async fn handle_list_drafts(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(params): Query<ListPostsQuery>,
) -> Result<Json<Value>, SocialError> {
    viewer.require()?;
    let ctx = context_of(&state, viewer).await?;
    let query = PostQuery {
        drafts: true,
        ..build_query(&state, &params).await?
    };
    run_listing(&state, ctx.as_ref(), &query, &params).await
}

pub async fn handle_list_replies(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<i64>,
    Query(params): Query<ListPostsQuery>,
) -> Result<Json<Value>, SocialError> {
    let ctx = context_of(&state, viewer).await?;
    visible_post(&state, ctx.as_ref(), id).await?;
    let query = PostQuery {
        reply_to: Some(id),
        ..build_query(&state, &params).await?
    };
    run_listing(&state, ctx.as_ref(), &query, &params).await
}

/// Loads the post `locator` addresses through the single-post policy; invisible posts are not found.
async fn visible_post_where(
    state: &AppState,
    ctx: Option<&SocialContext>,
    locator: Predicate,
    label: &str,
) -> Result<Post, SocialError> {
    let not_found = || SocialError::NotFound(format!("post {} was not found", label));
    let target = state
        .store
        .list_posts(&locator, Page::new(1, 0), PostOrder::Published)
        .await?
        .pop()
        .ok_or_else(not_found)?;
    let predicate = filter_by_id(single_post_policy(ctx, target.realm_id, Utc::now()), target.id);
    state
        .composer
        .list(ctx, &predicate, Page::new(1, 0), PostOrder::Published)
        .await?
        .pop()
        .ok_or_else(not_found)
}

async fn visible_post(state: &AppState, ctx: Option<&SocialContext>, id: i64) -> Result<Post, SocialError> {
    visible_post_where(state, ctx, Condition::IdIs(id).into(), &id.to_string()).await
}

/// A numeric id, or `area:alias` where area is the publisher name the alias lives under.
fn post_locator(raw: &str) -> Result<Predicate, SocialError> {
    if let Ok(id) = raw.parse::<i64>() {
        return Ok(Condition::IdIs(id).into());
    }
    match raw.split_once(':') {
        Some((area, alias)) if !area.is_empty() && !alias.is_empty() && !alias.contains(':') => {
            Ok(Condition::AliasIs {
                prefix: area.to_string(),
                alias: alias.to_string(),
            }
            .into())
        }
        _ => Err(SocialError::BadRequest(
            "invalid post id, must be a number or an area and alias divided by a colon".to_string(),
        )),
    }
}

pub async fn handle_get_post(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<String>,
) -> Result<Json<Post>, SocialError> {
    let locator = post_locator(&id)?;
    let ctx = context_of(&state, viewer).await?;
    Ok(Json(visible_post_where(&state, ctx.as_ref(), locator, &id).await?))
}

pub async fn handle_list_pinned(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(name): Path<String>,
    Query(params): Query<ListPostsQuery>,
) -> Result<Json<Value>, SocialError> {
    let publisher = state
        .store
        .publisher_by_name(&name)
        .await?
        .ok_or_else(|| SocialError::NotFound(format!("publisher {} was not found", name)))?;
    let ctx = context_of(&state, viewer).await?;
    let query = PostQuery {
        publisher: Some(publisher.id),
        pinned: true,
        ..build_query(&state, &params).await?
    };
    run_listing(&state, ctx.as_ref(), &query, &params).await
}

#[derive(Debug, Default, Deserialize)]
pub struct FeaturedQuery {
    pub take: Option<usize>,
}

pub async fn handle_featured(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(query): Query<FeaturedQuery>,
) -> Result<Json<Vec<Post>>, SocialError> {
    let ctx = context_of(&state, viewer).await?;
    let take = query.take.unwrap_or(DEFAULT_FEATURED).clamp(1, MAX_FEATURED);
    Ok(Json(state.composer.featured(ctx.as_ref(), take, Utc::now()).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct PublisherQuery {
    pub publisher: Option<String>,
}

/// The publisher `account` writes as: the named one, or their personal publisher.
async fn acting_publisher(state: &AppState, account: i64, name: Option<&str>) -> Result<Publisher, SocialError> {
    let publisher = match name.filter(|n| !n.is_empty()) {
        Some(name) => state
            .store
            .publisher_by_name(name)
            .await?
            .ok_or_else(|| SocialError::NotFound(format!("publisher {} was not found", name)))?,
        None => state
            .store
            .publishers_of_accounts(&[account])
            .await?
            .into_iter()
            .find(|p| p.publisher_type == PublisherType::Personal)
            .ok_or_else(|| SocialError::BadRequest("you need a publisher to create posts".to_string()))?,
    };
    if publisher.account_id != Some(account) {
        return Err(SocialError::Forbidden("you cannot post as this publisher".to_string()));
    }
    Ok(publisher)
}

pub async fn handle_create_post(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(params): Query<PublisherQuery>,
    Json(req): Json<PostRequest>,
) -> Result<(StatusCode, Json<Post>), SocialError> {
    let account = viewer.require()?;
    let author = acting_publisher(&state, account, params.publisher.as_deref()).await?;
    let writer = state.resolver.resolve(account).await?;
    let post = state.lifecycle.create(&author, &writer, req).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

pub async fn handle_update_post(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<i64>,
    Json(req): Json<PostRequest>,
) -> Result<Json<Post>, SocialError> {
    let account = viewer.require()?;
    let writer = state.resolver.resolve(account).await?;
    Ok(Json(state.lifecycle.edit(&writer, id, req).await?))
}

pub async fn handle_delete_post(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<i64>,
) -> Result<StatusCode, SocialError> {
    let account = viewer.require()?;
    state.lifecycle.delete(account, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 200 when the post is pinned now, 204 when the pin was removed.
pub async fn handle_pin(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<i64>,
) -> Result<StatusCode, SocialError> {
    let account = viewer.require()?;
    if state.lifecycle.pin(account, id).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NO_CONTENT)
    }
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub symbol: String,
    pub attitude: Attitude,
}

pub async fn handle_react(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<i64>,
    Json(req): Json<ReactRequest>,
) -> Result<(StatusCode, Json<Value>), SocialError> {
    let account = viewer.require()?;
    if req.symbol.trim().is_empty() {
        return Err(SocialError::BadRequest("symbol is required".to_string()));
    }
    let ctx = context_of(&state, viewer).await?;
    let post = visible_post(&state, ctx.as_ref(), id).await?;
    match state.lifecycle.react(account, &post, &req.symbol, req.attitude).await? {
        ReactionToggle::Added(reaction) => Ok((StatusCode::CREATED, Json(json!({ "reaction": reaction })))),
        ReactionToggle::Removed => Ok((StatusCode::OK, Json(json!({ "removed": true })))),
    }
}

pub async fn handle_flag(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path(id): Path<i64>,
) -> Result<Json<Value>, SocialError> {
    let account = viewer.require()?;
    let ctx = context_of(&state, viewer).await?;
    let post = visible_post(&state, ctx.as_ref(), id).await?;
    let (tally, collapsed) = state.lifecycle.flag(account, post.id).await?;
    Ok(Json(json!({ "flags": tally.flags, "collapsed": collapsed })))
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub limit: Option<usize>,
    pub cursor: Option<DateTime<Utc>>,
}

pub async fn handle_get_feed(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Query(query): Query<FeedQuery>,
) -> Result<Json<FeedPage>, SocialError> {
    let ctx = context_of(&state, viewer).await?;
    let limit = query.limit.unwrap_or(DEFAULT_FEED_LIMIT).min(state.config.feed.max_limit);
    Ok(Json(state.feed.get_feed(ctx.as_ref(), limit, query.cursor).await?))
}

fn subscription_target(kind: &str, id: i64) -> Result<SubscriptionTarget, SocialError> {
    match kind {
        "publisher" => Ok(SubscriptionTarget::Publisher(id)),
        "tag" => Ok(SubscriptionTarget::Tag(id)),
        "category" => Ok(SubscriptionTarget::Category(id)),
        other => Err(SocialError::BadRequest(format!("unknown subscription kind {}", other))),
    }
}

async fn forget_context(state: &AppState, account: i64) {
    if let Err(e) = state.resolver.invalidate(account).await {
        warn!("Failed to invalidate social context for account {}: {}", account, e);
    }
}

pub async fn handle_subscribe(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<(StatusCode, Json<Subscription>), SocialError> {
    let account = viewer.require()?;
    let target = subscription_target(&kind, id)?;
    if let SubscriptionTarget::Publisher(publisher) = target {
        if state.store.publisher(publisher).await?.is_none() {
            return Err(SocialError::NotFound(format!("publisher {} was not found", publisher)));
        }
    }
    let subscription = state.store.subscribe(account, target).await?;
    forget_context(&state, account).await;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn handle_unsubscribe(
    State(state): State<Arc<AppState>>,
    viewer: Viewer,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<StatusCode, SocialError> {
    let account = viewer.require()?;
    state.store.unsubscribe(account, subscription_target(&kind, id)?).await?;
    forget_context(&state, account).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Called by the identity service when an account's relationships change.
pub async fn handle_invalidate_relationships(
    State(state): State<Arc<AppState>>,
    _caller: InternalCaller,
    Path(account): Path<i64>,
) -> Result<Json<Value>, SocialError> {
    let dropped = state
        .resolver
        .invalidate(account)
        .await
        .map_err(|e| SocialError::Internal(e.to_string()))?;
    Ok(Json(json!({ "invalidated": dropped })))
}

pub fn configure_social_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/posts", get(handle_list_posts).post(handle_create_post))
        .route("/api/posts/search", get(handle_search_posts))
        .route("/api/posts/drafts", get(handle_list_drafts))
        .route(
            "/api/posts/{id}",
            get(handle_get_post).put(handle_update_post).delete(handle_delete_post),
        )
        .route("/api/posts/{id}/replies", get(handle_list_replies))
        .route("/api/posts/{id}/react", post(handle_react))
        .route("/api/posts/{id}/flag", post(handle_flag))
        .route("/api/posts/{id}/pin", post(handle_pin))
        .route("/api/publishers/{name}/pins", get(handle_list_pinned))
        .route("/api/recommendations/featured", get(handle_featured))
        .route("/api/feed", get(handle_get_feed))
        .route(
            "/api/subscriptions/{kind}/{id}",
            post(handle_subscribe).delete(handle_unsubscribe),
        )
        .route(
            "/api/internal/relationships/{account}/invalidate",
            post(handle_invalidate_relationships),
        )
}
