//! Boolean filter tree over posts.
//!
//! Filters are built as plain data so they can be inspected in tests, evaluated
//! against in-memory posts, or lowered to SQL by the storage layer. Every leaf
//! treats an absent optional column as "condition not met".

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::models::{Post, PostType, Visibility};

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    PublisherIn(BTreeSet<i64>),
    VisibilityIs(Visibility),
    /// Account appears in the post's allow-list.
    AllowListed(i64),
    /// Account appears in the post's deny-list.
    DenyListed(i64),
    RealmIn(BTreeSet<i64>),
    NoRealm,
    Draft,
    Reply,
    ReplyTo(i64),
    Collapsed,
    /// `published_at` is set and not yet reached at the given instant.
    ScheduledAfter(DateTime<Utc>),
    /// `published_until` is set and already passed at the given instant.
    ExpiredBefore(DateTime<Utc>),
    /// Publication time (or creation time for unpublished rows) is strictly earlier.
    PostedBefore(DateTime<Utc>),
    TypeIs(PostType),
    InCategory(i64),
    HasTag(i64),
    IdIs(i64),
    IdIn(BTreeSet<i64>),
    /// `alias_prefix:alias` address of a post.
    AliasIs { prefix: String, alias: String },
    Pinned,
    /// Case-insensitive substring match on content, title or description.
    TextMatches(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    True,
    False,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Leaf(Condition),
}

impl From<Condition> for Predicate {
    fn from(c: Condition) -> Self {
        Predicate::Leaf(c)
    }
}

impl Predicate {
    pub fn all(items: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::And(items.into_iter().collect()).simplify()
    }

    pub fn any(items: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Or(items.into_iter().collect()).simplify()
    }

    pub fn and(self, other: impl Into<Predicate>) -> Self {
        Predicate::all([self, other.into()])
    }

    pub fn or(self, other: impl Into<Predicate>) -> Self {
        Predicate::any([self, other.into()])
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self)).simplify()
    }

    /// Flattens nested conjunctions/disjunctions and folds constants.
    pub fn simplify(self) -> Self {
        match self {
            Predicate::And(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.into_iter().map(Predicate::simplify) {
                    match item {
                        Predicate::True => {}
                        Predicate::False => return Predicate::False,
                        Predicate::And(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Predicate::True,
                    1 => out.remove(0),
                    _ => Predicate::And(out),
                }
            }
            Predicate::Or(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.into_iter().map(Predicate::simplify) {
                    match item {
                        Predicate::False => {}
                        Predicate::True => return Predicate::True,
                        Predicate::Or(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Predicate::False,
                    1 => out.remove(0),
                    _ => Predicate::Or(out),
                }
            }
            Predicate::Not(inner) => match inner.simplify() {
                Predicate::True => Predicate::False,
                Predicate::False => Predicate::True,
                Predicate::Not(x) => *x,
                other => Predicate::Not(Box::new(other)),
            },
            Predicate::Leaf(Condition::PublisherIn(ids)) if ids.is_empty() => Predicate::False,
            Predicate::Leaf(Condition::RealmIn(ids)) if ids.is_empty() => Predicate::False,
            Predicate::Leaf(Condition::IdIn(ids)) if ids.is_empty() => Predicate::False,
            other => other,
        }
    }

    pub fn matches(&self, post: &Post) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::And(items) => items.iter().all(|p| p.matches(post)),
            Predicate::Or(items) => items.iter().any(|p| p.matches(post)),
            Predicate::Not(inner) => !inner.matches(post),
            Predicate::Leaf(condition) => condition.matches(post),
        }
    }
}

impl Condition {
    pub fn matches(&self, post: &Post) -> bool {
        match self {
            Condition::PublisherIn(ids) => ids.contains(&post.publisher_id),
            Condition::VisibilityIs(v) => post.visibility == *v,
            Condition::AllowListed(account) => post.visible_users.contains(account),
            Condition::DenyListed(account) => post.invisible_users.contains(account),
            Condition::RealmIn(ids) => post.realm_id.is_some_and(|r| ids.contains(&r)),
            Condition::NoRealm => post.realm_id.is_none(),
            Condition::Draft => post.is_draft,
            Condition::Reply => post.reply_id.is_some(),
            Condition::ReplyTo(id) => post.reply_id == Some(*id),
            Condition::Collapsed => post.is_collapsed,
            Condition::ScheduledAfter(t) => post.published_at.is_some_and(|p| p >= *t),
            Condition::ExpiredBefore(t) => post.published_until.is_some_and(|u| u < *t),
            Condition::PostedBefore(t) => post.posted_at() < *t,
            Condition::TypeIs(t) => post.post_type == *t,
            Condition::InCategory(id) => post.category_ids.contains(id),
            Condition::HasTag(id) => post.tag_ids.contains(id),
            Condition::IdIs(id) => post.id == *id,
            Condition::IdIn(ids) => ids.contains(&post.id),
            Condition::AliasIs { prefix, alias } => {
                post.alias_prefix.as_ref() == Some(prefix) && post.alias.as_ref() == Some(alias)
            }
            Condition::Pinned => post.pinned_at.is_some(),
            Condition::TextMatches(probe) => {
                let probe = probe.to_lowercase();
                ["content", "title", "description"]
                    .iter()
                    .filter_map(|field| post.body_str(field))
                    .any(|text| text.to_lowercase().contains(&probe))
            }
        }
    }
}

pub fn publisher_in(ids: impl IntoIterator<Item = i64>) -> Predicate {
    Condition::PublisherIn(ids.into_iter().collect()).into()
}

pub fn visibility_is(v: Visibility) -> Predicate {
    Condition::VisibilityIs(v).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared::test_utils::post;

    #[test]
    fn test_simplify_folds_constants() {
        let p = Predicate::And(vec![Predicate::True, visibility_is(Visibility::All), Predicate::True]);
        assert_eq!(p.simplify(), visibility_is(Visibility::All));

        let p = Predicate::Or(vec![Predicate::False, Predicate::Or(vec![Predicate::True])]);
        assert_eq!(p.simplify(), Predicate::True);

        assert_eq!(Predicate::all([Predicate::False, visibility_is(Visibility::All)]), Predicate::False);
        assert_eq!(Predicate::True.negate(), Predicate::False);
        assert_eq!(publisher_in(Vec::new()).simplify(), Predicate::False);
    }

    #[test]
    fn test_nested_conjunctions_flatten() {
        let p = Predicate::all([
            Predicate::all([Predicate::from(Condition::Draft), Predicate::from(Condition::Reply)]),
            Predicate::from(Condition::Collapsed),
        ]);
        match p {
            Predicate::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[test]
    fn test_optional_columns_never_match_when_absent() {
        let p = post(1, 10);
        let now = Utc::now();
        assert!(!Predicate::from(Condition::RealmIn([1].into())).matches(&p));
        assert!(!Predicate::from(Condition::ScheduledAfter(now)).matches(&p));
        assert!(!Predicate::from(Condition::ExpiredBefore(now)).matches(&p));
        assert!(Predicate::from(Condition::NoRealm).matches(&p));
        assert!(!Predicate::from(Condition::Pinned).matches(&p));
        let by_alias = Predicate::from(Condition::AliasIs {
            prefix: "user10".into(),
            alias: "hello".into(),
        });
        assert!(!by_alias.matches(&p));
    }

    #[test]
    fn test_alias_address_needs_both_parts() {
        let mut p = post(1, 10);
        p.alias = Some("hello".into());
        p.alias_prefix = Some("user10".into());
        let address = |prefix: &str| {
            Predicate::from(Condition::AliasIs {
                prefix: prefix.into(),
                alias: "hello".into(),
            })
        };
        assert!(address("user10").matches(&p));
        assert!(!address("user11").matches(&p));
        assert_eq!(Predicate::from(Condition::IdIn(BTreeSet::new())).simplify(), Predicate::False);
    }

    #[test]
    fn test_text_match_is_case_insensitive() {
        let mut p = post(1, 10);
        p.body = serde_json::json!({ "title": "Hello Rust", "content": "body" });
        assert!(Predicate::from(Condition::TextMatches("rust".into())).matches(&p));
        assert!(!Predicate::from(Condition::TextMatches("go".into())).matches(&p));
    }
}
