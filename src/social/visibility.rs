//! Access policy for posts, expressed as a [`Predicate`].
//!
//! A viewer sees a post they authored, or a post granted to them by its
//! visibility level whose publisher is not on either side of a block with
//! them. `None` visibility is author-only. Unless a community is requested
//! explicitly, posts are limited to those outside any community or inside one
//! the viewer can see. Anonymous viewers only see public posts outside
//! communities.

use serde::Deserialize;

use super::context::SocialContext;
use super::models::Visibility;
use super::predicate::{publisher_in, visibility_is, Condition, Predicate};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Friends,
    Following,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VisibilityScope {
    pub channel: Option<Channel>,
    /// Set when the caller asked for one specific community.
    pub explicit_realm: Option<i64>,
}

impl VisibilityScope {
    pub fn in_realm(realm: i64) -> Self {
        Self {
            channel: None,
            explicit_realm: Some(realm),
        }
    }
}

pub fn build(viewer: Option<&SocialContext>, scope: &VisibilityScope) -> Predicate {
    let Some(ctx) = viewer else {
        if scope.channel.is_some() {
            return Predicate::False;
        }
        return Predicate::all([visibility_is(Visibility::All), Condition::NoRealm.into()]);
    };

    let authored = publisher_in(ctx.own_publishers.iter().copied());
    let granted = Predicate::any([
        visibility_is(Visibility::All),
        visibility_is(Visibility::Friends).and(publisher_in(ctx.friends.iter().copied())),
        visibility_is(Visibility::Selected).and(Condition::AllowListed(ctx.account_id)),
        visibility_is(Visibility::Filtered).and(Predicate::from(Condition::DenyListed(ctx.account_id)).negate()),
    ]);
    let not_blocked = publisher_in(ctx.blocked()).negate();
    let mut predicate = authored.or(granted.and(not_blocked));

    if scope.explicit_realm.is_none() {
        let community = Predicate::from(Condition::NoRealm).or(Condition::RealmIn(ctx.realms.clone()));
        predicate = predicate.and(community);
    }

    match scope.channel {
        Some(Channel::Friends) => predicate.and(publisher_in(ctx.friends.iter().copied())),
        Some(Channel::Following) => predicate.and(publisher_in(ctx.following.iter().copied())),
        None => predicate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shared::test_utils::post;
    use crate::social::models::Post;
    use std::collections::BTreeSet;

    const AUTHOR: i64 = 10;
    const VIEWER_ACCOUNT: i64 = 200;

    fn viewer() -> SocialContext {
        SocialContext {
            account_id: VIEWER_ACCOUNT,
            own_publishers: BTreeSet::from([20, 21]),
            ..Default::default()
        }
    }

    fn visible(ctx: Option<&SocialContext>, p: &Post) -> bool {
        build(ctx, &VisibilityScope::default()).matches(p)
    }

    fn with_visibility(v: Visibility) -> Post {
        let mut p = post(1, AUTHOR);
        p.visibility = v;
        p
    }

    #[test]
    fn test_public_posts_are_visible_to_everyone() {
        let p = with_visibility(Visibility::All);
        assert!(visible(None, &p));
        assert!(visible(Some(&viewer()), &p));
        assert!(visible(Some(&SocialContext::default()), &p));
    }

    #[test]
    fn test_none_is_owner_only() {
        let mut ctx = viewer();
        ctx.friends.insert(AUTHOR);
        let p = with_visibility(Visibility::None);
        assert!(!visible(None, &p));
        assert!(!visible(Some(&ctx), &p));

        let mut own = with_visibility(Visibility::None);
        own.publisher_id = 21;
        assert!(visible(Some(&ctx), &own));
    }

    #[test]
    fn test_friends_visibility_requires_friendship() {
        let p = with_visibility(Visibility::Friends);
        assert!(!visible(Some(&viewer()), &p));
        let mut ctx = viewer();
        ctx.friends.insert(AUTHOR);
        assert!(visible(Some(&ctx), &p));
        assert!(!visible(None, &p));
    }

    #[test]
    fn test_selected_requires_literal_membership() {
        let mut p = with_visibility(Visibility::Selected);
        assert!(!visible(Some(&viewer()), &p), "empty allow-list admits nobody but the author");
        p.visible_users = vec![999];
        assert!(!visible(Some(&viewer()), &p));
        p.visible_users.push(VIEWER_ACCOUNT);
        assert!(visible(Some(&viewer()), &p));
    }

    #[test]
    fn test_filtered_excludes_deny_listed() {
        let mut p = with_visibility(Visibility::Filtered);
        assert!(visible(Some(&viewer()), &p));
        p.invisible_users = vec![VIEWER_ACCOUNT];
        assert!(!visible(Some(&viewer()), &p));
    }

    #[test]
    fn test_block_is_an_absolute_veto_in_both_directions() {
        let mut selected = with_visibility(Visibility::Selected);
        selected.visible_users = vec![VIEWER_ACCOUNT];
        let grants = [
            with_visibility(Visibility::All),
            with_visibility(Visibility::Friends),
            selected,
            with_visibility(Visibility::Filtered),
        ];

        let mut friend = viewer();
        friend.friends.insert(AUTHOR);
        for p in &grants {
            assert!(visible(Some(&friend), p));
        }

        let mut blocked = friend.clone();
        blocked.blocking.insert(AUTHOR);
        let mut blocker = friend.clone();
        blocker.blocked_by.insert(AUTHOR);
        for p in &grants {
            assert!(!visible(Some(&blocked), p));
            assert!(!visible(Some(&blocker), p));
        }
    }

    #[test]
    fn test_community_scope_limits_to_visible_realms() {
        let mut p = post(1, AUTHOR);
        p.realm_id = Some(7);
        assert!(!visible(None, &p));
        assert!(!visible(Some(&viewer()), &p));

        let mut member = viewer();
        member.realms.insert(7);
        assert!(visible(Some(&member), &p));

        let explicit = VisibilityScope::in_realm(7);
        assert!(build(Some(&viewer()), &explicit).matches(&p));
    }

    #[test]
    fn test_anonymous_sees_only_unscoped_public_posts() {
        let plain = post(1, AUTHOR);
        let mut scoped = post(2, AUTHOR);
        scoped.realm_id = Some(3);
        let predicate = build(None, &VisibilityScope::default());
        assert!(predicate.matches(&plain));
        assert!(!predicate.matches(&scoped));
        assert!(!build(None, &VisibilityScope::in_realm(3)).matches(&scoped));
    }

    #[test]
    fn test_channels_narrow_the_visible_set() {
        let mut ctx = viewer();
        ctx.friends.insert(AUTHOR);
        ctx.following.insert(11);
        let from_friend = post(1, AUTHOR);
        let from_followed = post(2, 11);

        let friends = VisibilityScope {
            channel: Some(Channel::Friends),
            explicit_realm: None,
        };
        assert!(build(Some(&ctx), &friends).matches(&from_friend));
        assert!(!build(Some(&ctx), &friends).matches(&from_followed));

        let following = VisibilityScope {
            channel: Some(Channel::Following),
            explicit_realm: None,
        };
        assert!(build(Some(&ctx), &following).matches(&from_followed));
        assert!(!build(Some(&ctx), &following).matches(&from_friend));

        let mut hidden = post(3, 11);
        hidden.visibility = Visibility::Friends;
        assert!(!build(Some(&ctx), &following).matches(&hidden));
        assert_eq!(build(None, &following), Predicate::False);
    }
}
