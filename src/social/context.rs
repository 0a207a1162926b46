//! Per-viewer social context: who the viewer is friends with, who is blocked
//! in either direction, whom they follow and which communities they can see.
//!
//! Posts reference publishers, so account relationships are translated to the
//! personal publishers of those accounts before they are stored. Contexts are
//! cached under a per-account tag so a relationship change drops exactly one entry.

use futures::future::join4;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::models::PublisherType;
use super::store::{ContentStore, StoreError};
use crate::core::cache::{get_json, put_json, CacheError, TagCache};
use crate::core::upstream::{CommunityDirectory, Direction, Relationship, SocialGraph, UpstreamError};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialContext {
    pub account_id: i64,
    /// Every publisher the viewer acts as.
    pub own_publishers: BTreeSet<i64>,
    pub friends: BTreeSet<i64>,
    /// Publishers whose accounts blocked the viewer.
    pub blocked_by: BTreeSet<i64>,
    /// Publishers whose accounts the viewer blocked.
    pub blocking: BTreeSet<i64>,
    pub following: BTreeSet<i64>,
    pub realms: BTreeSet<i64>,
}

impl SocialContext {
    /// Publishers on either side of a block with the viewer.
    pub fn blocked(&self) -> BTreeSet<i64> {
        self.blocked_by.union(&self.blocking).copied().collect()
    }

    pub fn owns(&self, publisher_id: i64) -> bool {
        self.own_publishers.contains(&publisher_id)
    }
}

pub fn context_key(account: i64) -> String {
    format!("social-context#{}", account)
}

pub fn account_tag(account: i64) -> String {
    format!("user#{}", account)
}

pub struct SocialContextResolver {
    cache: Arc<dyn TagCache>,
    store: Arc<dyn ContentStore>,
    graph: Arc<dyn SocialGraph>,
    communities: Arc<dyn CommunityDirectory>,
    ttl: Duration,
    timeout: Duration,
}

impl SocialContextResolver {
    pub fn new(
        cache: Arc<dyn TagCache>,
        store: Arc<dyn ContentStore>,
        graph: Arc<dyn SocialGraph>,
        communities: Arc<dyn CommunityDirectory>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            graph,
            communities,
            ttl,
            timeout,
        }
    }

    /// Returns the cached context for `account`, computing it on a miss.
    ///
    /// External failures degrade to empty relationship sets; such a context is
    /// returned but never cached. Local store failures are errors.
    pub async fn resolve(&self, account: i64) -> Result<SocialContext, StoreError> {
        let key = context_key(account);
        match get_json::<SocialContext>(self.cache.as_ref(), &key).await {
            Ok(Some(ctx)) => {
                trace!("Social context cache hit for account {}", account);
                return Ok(ctx);
            }
            Ok(None) => debug!("Social context cache miss for account {}", account),
            Err(e) => warn!("Social context cache read failed for account {}: {}", account, e),
        }

        let (friends, blocked_by, blocking, realms) = join4(
            self.bounded("friends", self.graph.list_related(account, Relationship::Friend, Direction::Outgoing)),
            self.bounded("blocked-by", self.graph.list_related(account, Relationship::Blocked, Direction::Incoming)),
            self.bounded("blocking", self.graph.list_related(account, Relationship::Blocked, Direction::Outgoing)),
            self.bounded("communities", self.communities.list_available(account, true)),
        )
        .await;
        let degraded = friends.is_none() || blocked_by.is_none() || blocking.is_none() || realms.is_none();
        let friends = friends.unwrap_or_default();
        let blocked_by = blocked_by.unwrap_or_default();
        let blocking = blocking.unwrap_or_default();

        let mut accounts: Vec<i64> = friends
            .iter()
            .chain(blocked_by.iter())
            .chain(blocking.iter())
            .copied()
            .chain(std::iter::once(account))
            .collect();
        accounts.sort_unstable();
        accounts.dedup();
        let publishers = self.store.publishers_of_accounts(&accounts).await?;
        let following = self.store.followed_publishers(account).await?;

        let personal_of = |ids: &[i64]| -> BTreeSet<i64> {
            publishers
                .iter()
                .filter(|p| p.publisher_type == PublisherType::Personal)
                .filter(|p| p.account_id.is_some_and(|a| ids.contains(&a)))
                .map(|p| p.id)
                .collect()
        };

        let ctx = SocialContext {
            account_id: account,
            own_publishers: publishers
                .iter()
                .filter(|p| p.account_id == Some(account))
                .map(|p| p.id)
                .collect(),
            friends: personal_of(&friends),
            blocked_by: personal_of(&blocked_by),
            blocking: personal_of(&blocking),
            following: following.into_iter().collect(),
            realms: realms.unwrap_or_default().into_iter().collect(),
        };

        if degraded {
            warn!("Serving degraded social context for account {} without caching it", account);
        } else if let Err(e) = put_json(self.cache.as_ref(), &key, &ctx, self.ttl, &[account_tag(account)]).await {
            warn!("Failed to cache social context for account {}: {}", account, e);
        }
        Ok(ctx)
    }

    /// Drops the cached context of `account`.
    pub async fn invalidate(&self, account: i64) -> Result<usize, CacheError> {
        let dropped = self.cache.invalidate(&account_tag(account)).await?;
        debug!("Invalidated {} cached entries for account {}", dropped, account);
        Ok(dropped)
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Failed to load {} for social context: {}", what, e);
                None
            }
            Err(_) => {
                warn!("Timed out loading {} for social context after {:?}", what, self.timeout);
                None
            }
        }
    }
}
