use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum Visibility {
    All,
    Friends,
    Filtered,
    Selected,
    None,
}

impl Visibility {
    pub fn as_i16(self) -> i16 {
        match self {
            Visibility::All => 0,
            Visibility::Friends => 1,
            Visibility::Filtered => 2,
            Visibility::Selected => 3,
            Visibility::None => 4,
        }
    }
}

impl From<Visibility> for i16 {
    fn from(v: Visibility) -> Self {
        v.as_i16()
    }
}

impl TryFrom<i16> for Visibility {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Visibility::All),
            1 => Ok(Visibility::Friends),
            2 => Ok(Visibility::Filtered),
            3 => Ok(Visibility::Selected),
            4 => Ok(Visibility::None),
            other => Err(format!("unknown visibility level {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    Story,
    Article,
    Question,
    Video,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Story => "story",
            PostType::Article => "article",
            PostType::Question => "question",
            PostType::Video => "video",
        }
    }
}

impl std::str::FromStr for PostType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "story" => Ok(PostType::Story),
            "article" => Ok(PostType::Article),
            "question" => Ok(PostType::Question),
            "video" => Ok(PostType::Video),
            other => Err(format!("unknown post type {}", other)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostMetric {
    pub reaction_count: i64,
    pub reaction_list: BTreeMap<String, i64>,
    pub reply_count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    #[serde(rename = "type")]
    pub post_type: PostType,
    pub body: Value,
    pub language: String,
    pub alias: Option<String>,
    pub alias_prefix: Option<String>,
    pub visibility: Visibility,
    pub visible_users: Vec<i64>,
    pub invisible_users: Vec<i64>,
    pub realm_id: Option<i64>,
    pub is_draft: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub published_until: Option<DateTime<Utc>>,
    pub reply_id: Option<i64>,
    pub repost_id: Option<i64>,
    pub total_upvote: i32,
    pub total_downvote: i32,
    pub total_views: i64,
    pub total_aggressive_views: i64,
    pub is_collapsed: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub pinned_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub publisher_id: i64,
    pub category_ids: Vec<i64>,
    pub tag_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metric: Option<PostMetric>,
}

impl Post {
    /// Timestamp a post is ordered and paginated by.
    pub fn posted_at(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.created_at)
    }

    pub fn body_str(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Attachment ids referenced by the body: the attachment list, the thumbnail and the video.
    pub fn attachment_rids(&self) -> Vec<String> {
        let mut rids: Vec<String> = self
            .body
            .get("attachments")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        for field in ["thumbnail", "video"] {
            if let Some(rid) = self.body_str(field) {
                rids.push(rid.to_string());
            }
        }
        rids
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum PublisherType {
    Personal,
    Organization,
    Anonymous,
}

impl From<PublisherType> for i16 {
    fn from(t: PublisherType) -> Self {
        match t {
            PublisherType::Personal => 0,
            PublisherType::Organization => 1,
            PublisherType::Anonymous => 2,
        }
    }
}

impl TryFrom<i16> for PublisherType {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PublisherType::Personal),
            1 => Ok(PublisherType::Organization),
            2 => Ok(PublisherType::Anonymous),
            other => Err(format!("unknown publisher type {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Publisher {
    pub id: i64,
    #[serde(rename = "type")]
    pub publisher_type: PublisherType,
    pub name: String,
    pub nick: String,
    pub description: String,
    pub realm_id: Option<i64>,
    pub account_id: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum SubscriptionTarget {
    Publisher(i64),
    Tag(i64),
    Category(i64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub follower_id: i64,
    pub target: SubscriptionTarget,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum Attitude {
    Neutral,
    Positive,
    Negative,
}

impl From<Attitude> for i16 {
    fn from(a: Attitude) -> Self {
        match a {
            Attitude::Neutral => 0,
            Attitude::Positive => 1,
            Attitude::Negative => 2,
        }
    }
}

impl TryFrom<i16> for Attitude {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Attitude::Neutral),
            1 => Ok(Attitude::Positive),
            2 => Ok(Attitude::Negative),
            other => Err(format!("unknown attitude {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: i64,
    pub symbol: String,
    pub attitude: Attitude,
    pub post_id: i64,
    pub account_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReactionToggle {
    Added(Reaction),
    Removed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub alias: String,
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub alias: String,
    pub name: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FediverseUser {
    pub id: i64,
    pub identifier: String,
    pub origin: String,
    pub name: String,
    pub nick: String,
    pub avatar: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FediversePost {
    pub id: i64,
    pub identifier: String,
    pub origin: String,
    pub content: String,
    pub language: String,
    pub images: Vec<String>,
    pub user: FediverseUser,
    pub created_at: DateTime<Utc>,
}
