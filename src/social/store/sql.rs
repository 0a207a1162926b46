//! Lowers a [`Predicate`] to a boxed diesel filter on `posts`.

use chrono::{DateTime, Utc};
use diesel::dsl::sql;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Double, Text, Timestamptz};

use crate::core::shared::schema::{post_categories, post_tags, posts};
use crate::social::predicate::{Condition, Predicate};

pub type PostFilter = Box<dyn BoxableExpression<posts::table, Pg, SqlType = Bool>>;

pub fn lower(predicate: &Predicate) -> PostFilter {
    match predicate {
        Predicate::True => Box::new(sql::<Bool>("TRUE")),
        Predicate::False => Box::new(sql::<Bool>("FALSE")),
        Predicate::And(items) => fold(items, |acc, next| Box::new(acc.and(next)), || lower(&Predicate::True)),
        Predicate::Or(items) => fold(items, |acc, next| Box::new(acc.or(next)), || lower(&Predicate::False)),
        Predicate::Not(inner) => Box::new(diesel::dsl::not(lower(inner))),
        Predicate::Leaf(condition) => lower_condition(condition),
    }
}

fn fold(
    items: &[Predicate],
    combine: impl Fn(PostFilter, PostFilter) -> PostFilter,
    empty: impl Fn() -> PostFilter,
) -> PostFilter {
    let mut lowered = items.iter().map(lower);
    match lowered.next() {
        Some(first) => lowered.fold(first, combine),
        None => empty(),
    }
}

fn lower_condition(condition: &Condition) -> PostFilter {
    match condition {
        Condition::PublisherIn(ids) => Box::new(posts::publisher_id.eq_any(ids.iter().copied().collect::<Vec<_>>())),
        Condition::VisibilityIs(v) => Box::new(posts::visibility.eq(v.as_i16())),
        Condition::AllowListed(account) => Box::new(posts::visible_users.contains(vec![*account])),
        Condition::DenyListed(account) => Box::new(posts::invisible_users.contains(vec![*account])),
        Condition::RealmIn(ids) => Box::new(
            posts::realm_id
                .is_not_null()
                .and(posts::realm_id.assume_not_null().eq_any(ids.iter().copied().collect::<Vec<_>>())),
        ),
        Condition::NoRealm => Box::new(posts::realm_id.is_null()),
        Condition::Draft => Box::new(posts::is_draft.eq(true)),
        Condition::Reply => Box::new(posts::reply_id.is_not_null()),
        Condition::ReplyTo(id) => Box::new(
            posts::reply_id
                .is_not_null()
                .and(posts::reply_id.assume_not_null().eq(*id)),
        ),
        Condition::Collapsed => Box::new(posts::is_collapsed.eq(true)),
        Condition::ScheduledAfter(t) => Box::new(
            posts::published_at
                .is_not_null()
                .and(posts::published_at.assume_not_null().ge(*t)),
        ),
        Condition::ExpiredBefore(t) => Box::new(
            posts::published_until
                .is_not_null()
                .and(posts::published_until.assume_not_null().lt(*t)),
        ),
        Condition::PostedBefore(t) => Box::new(
            posts::published_at
                .is_not_null()
                .and(posts::published_at.assume_not_null().lt(*t))
                .or(posts::published_at.is_null().and(posts::created_at.lt(*t))),
        ),
        Condition::TypeIs(t) => Box::new(posts::post_type.eq(t.as_str())),
        Condition::InCategory(id) => Box::new(
            posts::id.eq_any(
                post_categories::table
                    .filter(post_categories::category_id.eq(*id))
                    .select(post_categories::post_id),
            ),
        ),
        Condition::HasTag(id) => Box::new(
            posts::id.eq_any(
                post_tags::table
                    .filter(post_tags::tag_id.eq(*id))
                    .select(post_tags::post_id),
            ),
        ),
        Condition::IdIs(id) => Box::new(posts::id.eq(*id)),
        Condition::IdIn(ids) => Box::new(posts::id.eq_any(ids.iter().copied().collect::<Vec<_>>())),
        Condition::AliasIs { prefix, alias } => Box::new(
            posts::alias_prefix
                .is_not_null()
                .and(posts::alias_prefix.assume_not_null().eq(prefix.clone()))
                .and(posts::alias.is_not_null())
                .and(posts::alias.assume_not_null().eq(alias.clone())),
        ),
        Condition::Pinned => Box::new(posts::pinned_at.is_not_null()),
        Condition::TextMatches(probe) => {
            let pattern = format!("%{}%", escape_like(probe));
            Box::new(
                sql::<Bool>("(posts.body->>'content' ILIKE ")
                    .bind::<Text, _>(pattern.clone())
                    .sql(" OR posts.body->>'title' ILIKE ")
                    .bind::<Text, _>(pattern.clone())
                    .sql(" OR posts.body->>'description' ILIKE ")
                    .bind::<Text, _>(pattern)
                    .sql(")"),
            )
        }
    }
}

fn escape_like(probe: &str) -> String {
    let mut out = String::with_capacity(probe.len());
    for c in probe.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `COALESCE(published_at, created_at)`, the timestamp posts are paged by.
pub fn posted_at() -> diesel::expression::SqlLiteral<Timestamptz> {
    sql::<Timestamptz>("COALESCE(posts.published_at, posts.created_at)")
}

/// Engagement score with decay measured against `now`.
pub fn rank_score(now: DateTime<Utc>) -> Box<dyn BoxableExpression<posts::table, Pg, SqlType = Double>> {
    Box::new(sql::<Double>(
        "(((posts.total_upvote - posts.total_downvote)::float8 + LOG(1 + posts.total_aggressive_views::float8)) \
         / POWER(GREATEST(EXTRACT(EPOCH FROM (",
    )
    .bind::<Timestamptz, _>(now)
    .sql(" - COALESCE(posts.published_at, posts.created_at)))::float8 / 3600.0, 0) + 2, 1.5))"))
}
