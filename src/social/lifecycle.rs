use chrono::{DateTime, Utc};
use log::{info, warn};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, LazyLock};

use super::composer::single_post_policy;
use super::context::SocialContext;
use super::models::{Attitude, Category, Post, PostType, Publisher, ReactionToggle, Tag, Visibility};
use super::notifier::SubscriptionNotifier;
use super::store::{ContentStore, FlagTally, NewReaction};
use super::SocialError;
use crate::core::background::BackgroundPool;
use crate::core::shared::utils::truncate_chars;
use crate::core::upstream::AttachmentService;

/// Characters of `content` kept when a listing asks for truncation.
pub const LISTING_CONTENT_CHARS: usize = 160;
/// Share of flags per unique view at which a post collapses.
pub const COLLAPSE_FLAG_RATIO: f64 = 0.5;

static ALIAS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9.-]+$").expect("Invalid alias regex"));

fn default_language() -> String {
    "en".to_string()
}

fn default_type() -> PostType {
    PostType::Story
}

#[derive(Clone, Debug, Deserialize)]
pub struct PostRequest {
    #[serde(rename = "type", default = "default_type")]
    pub post_type: PostType,
    #[serde(default)]
    pub body: Value,
    #[serde(default = "default_language")]
    pub language: String,
    pub alias: Option<String>,
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub visible_users: Vec<i64>,
    #[serde(default)]
    pub invisible_users: Vec<i64>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub realm_id: Option<i64>,
    #[serde(default)]
    pub is_draft: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub published_until: Option<DateTime<Utc>>,
    pub reply_to: Option<i64>,
    pub repost_to: Option<i64>,
}

impl PostRequest {
    fn visibility(&self) -> Visibility {
        self.visibility.unwrap_or(Visibility::All)
    }

    fn validate(&self) -> Result<(), SocialError> {
        if !self.body.is_object() {
            return Err(SocialError::BadRequest("post body must be an object".to_string()));
        }
        if let Some(alias) = self.alias.as_deref().filter(|a| !a.is_empty()) {
            if !ALIAS_REGEX.is_match(alias) {
                return Err(SocialError::BadRequest(
                    "alias may only contain lowercase letters, digits, dots and dashes".to_string(),
                ));
            }
        }
        match self.visibility() {
            Visibility::Selected if self.visible_users.is_empty() => Err(SocialError::BadRequest(
                "selected visibility requires at least one visible user".to_string(),
            )),
            Visibility::Filtered if self.invisible_users.is_empty() => Err(SocialError::BadRequest(
                "filtered visibility requires at least one invisible user".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Cuts long `content` for listings, flagging the body so it cannot be saved back.
pub fn truncate_post_content(post: &mut Post) {
    let Some(content) = post.body.get("content").and_then(Value::as_str) else {
        return;
    };
    let length = content.chars().count();
    let (short, cut) = truncate_chars(content, LISTING_CONTENT_CHARS);
    if !cut {
        return;
    }
    if let Some(body) = post.body.as_object_mut() {
        body.insert("content".to_string(), Value::String(short));
        body.insert("content_truncated".to_string(), Value::Bool(true));
        body.insert("content_length".to_string(), Value::from(length));
    }
}

pub struct PostLifecycle {
    store: Arc<dyn ContentStore>,
    attachments: Arc<dyn AttachmentService>,
    notifier: Arc<SubscriptionNotifier>,
    background: BackgroundPool,
}

impl PostLifecycle {
    pub fn new(
        store: Arc<dyn ContentStore>,
        attachments: Arc<dyn AttachmentService>,
        notifier: Arc<SubscriptionNotifier>,
        background: BackgroundPool,
    ) -> Self {
        Self {
            store,
            attachments,
            notifier,
            background,
        }
    }

    async fn resolve_terms(&self, req: &PostRequest) -> Result<(Vec<Category>, Vec<Tag>), SocialError> {
        let categories = if req.categories.is_empty() {
            Vec::new()
        } else {
            let found = self.store.categories_by_alias(&req.categories).await?;
            if let Some(missing) = req.categories.iter().find(|a| !found.iter().any(|c| &c.alias == *a)) {
                return Err(SocialError::BadRequest(format!("category {} was not found", missing)));
            }
            found
        };
        let tags = if req.tags.is_empty() {
            Vec::new()
        } else {
            self.store.ensure_tags(&req.tags).await?
        };
        Ok((categories, tags))
    }

    /// The replied or reposted post must exist and be visible to the writer.
    async fn require_related(&self, writer: &SocialContext, id: Option<i64>) -> Result<(), SocialError> {
        let Some(id) = id else {
            return Ok(());
        };
        let visible = self
            .store
            .get_post(id)
            .await?
            .filter(|p| single_post_policy(Some(writer), p.realm_id, Utc::now()).matches(p));
        if visible.is_none() {
            return Err(SocialError::NotFound(format!("related post {} was not found", id)));
        }
        Ok(())
    }

    fn require_member(writer: &SocialContext, realm: Option<i64>) -> Result<(), SocialError> {
        match realm {
            Some(realm) if !writer.realms.contains(&realm) => Err(SocialError::Forbidden(format!(
                "you are not a member of realm {}",
                realm
            ))),
            _ => Ok(()),
        }
    }

    /// Creates a post as `author`. `writer` is the social context of the account behind it.
    pub async fn create(&self, author: &Publisher, writer: &SocialContext, req: PostRequest) -> Result<Post, SocialError> {
        let now = Utc::now();
        req.validate()?;
        if req.published_at.is_some_and(|at| at < now) {
            return Err(SocialError::BadRequest("post cannot be published before now".to_string()));
        }
        if req.realm_id != author.realm_id {
            Self::require_member(writer, req.realm_id)?;
        }
        self.require_related(writer, req.reply_to).await?;
        self.require_related(writer, req.repost_to).await?;
        let (categories, tags) = self.resolve_terms(&req).await?;

        let visibility = req.visibility();
        let published_at = req.published_at.or((!req.is_draft).then_some(now));
        let post = Post {
            id: 0,
            post_type: req.post_type,
            body: req.body,
            language: req.language,
            alias: req.alias.filter(|a| !a.is_empty()),
            alias_prefix: Some(author.name.clone()),
            visibility,
            visible_users: req.visible_users,
            invisible_users: req.invisible_users,
            realm_id: req.realm_id.or(author.realm_id),
            is_draft: req.is_draft,
            published_at,
            published_until: req.published_until,
            reply_id: req.reply_to,
            repost_id: req.repost_to,
            total_upvote: 0,
            total_downvote: 0,
            total_views: 0,
            total_aggressive_views: 0,
            is_collapsed: false,
            locked_at: None,
            pinned_at: None,
            edited_at: None,
            publisher_id: author.id,
            category_ids: categories.iter().map(|c| c.id).collect(),
            tag_ids: tags.iter().map(|t| t.id).collect(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            metric: None,
        };
        let post = self.store.insert_post(post).await?;
        info!("Publisher {} created post {}", author.id, post.id);

        self.track_attachments(Vec::new(), post.attachment_rids(), post.visibility);
        self.announce(&post, author, tags, categories);
        Ok(post)
    }

    pub async fn edit(&self, editor: &SocialContext, id: i64, mut req: PostRequest) -> Result<Post, SocialError> {
        let (existing, author) = self.owned_post(editor.account_id, id).await?;
        req.visibility = req.visibility.or(Some(existing.visibility));
        if existing.is_locked() {
            return Err(SocialError::Forbidden("post is locked and cannot be edited".to_string()));
        }
        if req.body.get("content_truncated").and_then(Value::as_bool).unwrap_or(false) {
            return Err(SocialError::BadRequest(
                "prevented from editing post with truncated content".to_string(),
            ));
        }
        req.validate()?;
        if req.realm_id.is_some() && req.realm_id != existing.realm_id && req.realm_id != author.realm_id {
            Self::require_member(editor, req.realm_id)?;
        }
        let now = Utc::now();
        if req.published_at != existing.published_at && req.published_at.is_some_and(|at| at < now) {
            return Err(SocialError::BadRequest("post cannot be published before now".to_string()));
        }
        let (categories, tags) = self.resolve_terms(&req).await?;

        let was_draft = existing.is_draft;
        let visibility = req.visibility();
        let mut post = existing.clone();
        post.post_type = req.post_type;
        post.body = req.body;
        post.language = req.language;
        post.alias = req.alias.filter(|a| !a.is_empty());
        post.visibility = visibility;
        post.visible_users = req.visible_users;
        post.invisible_users = req.invisible_users;
        post.realm_id = req.realm_id.or(existing.realm_id);
        post.is_draft = req.is_draft;
        post.published_at = req.published_at.or(existing.published_at);
        if !post.is_draft && post.published_at.is_none() {
            post.published_at = Some(now);
        }
        post.published_until = req.published_until;
        post.category_ids = categories.iter().map(|c| c.id).collect();
        post.tag_ids = tags.iter().map(|t| t.id).collect();
        post.edited_at = Some(now);
        post.updated_at = now;

        let saved = self.store.update_post(&post).await?;
        if existing.body != saved.body || existing.visibility != saved.visibility {
            self.track_attachments(existing.attachment_rids(), saved.attachment_rids(), saved.visibility);
        }
        if was_draft && !saved.is_draft {
            self.announce(&saved, &author, tags, categories);
        }
        Ok(saved)
    }

    pub async fn delete(&self, editor: i64, id: i64) -> Result<(), SocialError> {
        let (post, _) = self.owned_post(editor, id).await?;
        self.store.soft_delete_post(post.id, Utc::now()).await?;
        info!("Post {} deleted by account {}", post.id, editor);
        self.track_attachments(post.attachment_rids(), Vec::new(), post.visibility);
        Ok(())
    }

    /// Pins or unpins one of the editor's posts. Returns whether it is pinned now.
    pub async fn pin(&self, editor: i64, id: i64) -> Result<bool, SocialError> {
        let (mut post, _) = self.owned_post(editor, id).await?;
        let now = Utc::now();
        post.pinned_at = match post.pinned_at {
            Some(_) => None,
            None => Some(now),
        };
        post.updated_at = now;
        let saved = self.store.update_post(&post).await?;
        let pinned = saved.pinned_at.is_some();
        info!("Post {} {} by account {}", saved.id, if pinned { "pinned" } else { "unpinned" }, editor);
        Ok(pinned)
    }

    pub async fn react(&self, account: i64, post: &Post, symbol: &str, attitude: Attitude) -> Result<ReactionToggle, SocialError> {
        let outcome = self
            .store
            .toggle_reaction(NewReaction {
                symbol: symbol.to_string(),
                attitude,
                post_id: post.id,
                account_id: account,
            })
            .await?;
        if matches!(outcome, ReactionToggle::Added(_)) {
            let notifier = Arc::clone(&self.notifier);
            let post = post.clone();
            let symbol = symbol.to_string();
            self.background.submit("reaction-notification", async move {
                notifier.on_post_reacted(&post, account, &symbol).await.map(|_| ())
            });
        }
        Ok(outcome)
    }

    /// Records a flag and collapses the post once flags reach half of its unique views.
    pub async fn flag(&self, account: i64, post_id: i64) -> Result<(FlagTally, bool), SocialError> {
        let tally = self.store.add_flag(post_id, account).await?;
        let ratio = tally.flags as f64 / tally.total_views.max(1) as f64;
        let collapse = ratio >= COLLAPSE_FLAG_RATIO;
        if collapse {
            self.store.set_collapsed(post_id, true).await?;
            warn!("Post {} collapsed after {} flags", post_id, tally.flags);
        }
        Ok((tally, collapse))
    }

    async fn owned_post(&self, editor: i64, id: i64) -> Result<(Post, Publisher), SocialError> {
        let post = self
            .store
            .get_post(id)
            .await?
            .ok_or_else(|| SocialError::NotFound(format!("post {} was not found", id)))?;
        let publisher = self
            .store
            .publisher(post.publisher_id)
            .await?
            .ok_or_else(|| SocialError::NotFound(format!("publisher {} was not found", post.publisher_id)))?;
        if publisher.account_id != Some(editor) {
            return Err(SocialError::Forbidden("you are not the author of this post".to_string()));
        }
        Ok((post, publisher))
    }

    fn track_attachments(&self, removed: Vec<String>, added: Vec<String>, visibility: Visibility) {
        if removed.is_empty() && added.is_empty() {
            return;
        }
        let attachments = Arc::clone(&self.attachments);
        self.background.submit("attachment-usage", async move {
            if !removed.is_empty() {
                attachments.adjust_usage(&removed, -1).await?;
            }
            if !added.is_empty() {
                attachments.adjust_usage(&added, 1).await?;
                attachments.set_indexable(&added, visibility == Visibility::All).await?;
            }
            Ok(())
        });
    }

    fn announce(&self, post: &Post, author: &Publisher, tags: Vec<Tag>, categories: Vec<Category>) {
        let notifier = Arc::clone(&self.notifier);
        let post = post.clone();
        let author = author.clone();
        if post.reply_id.is_some() {
            self.background.submit("reply-notification", async move {
                notifier.on_reply_published(&post, &author).await.map(|_| ())
            });
        } else if !post.is_draft {
            self.background.submit("subscription-notification", async move {
                notifier
                    .on_post_published(&post, &author, &tags, &categories)
                    .await
                    .map(|_| ())
            });
        }
    }
}
