use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use cache::{CacheService, ScoredMember};
use parking_lot::Mutex;
use rand::Rng;
use shared::{
    domain::{GroupId, GroupMember, Role, UserId},
    protocol::now_millis,
};
use tracing::{debug, warn};

use crate::{config::DeliveryConfig, error::DeliveryError};

/// Sorted set of cached group ids scored by last access.
pub const ACTIVE_INDEX_KEY: &str = "group:active";
pub const MEMBERS_KEY_PREFIX: &str = "group:members:";

/// Stored in place of members for a group that has none, so repeated
/// lookups of an empty group stay in the cache.
const EMPTY_SENTINEL: &str = "__empty__";
const EMPTY_SCORE: f64 = -1.0;

/// Durable source of group membership, consulted on a cache miss.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn group_members(&self, group: GroupId) -> anyhow::Result<Vec<GroupMember>>;
}

pub fn members_key(group: GroupId) -> String {
    format!("{MEMBERS_KEY_PREFIX}{group}")
}

/// Read-through cache of group membership with bounded size.
pub struct GroupCache {
    cache: Arc<dyn CacheService>,
    source: Arc<dyn MembershipSource>,
    max_groups: usize,
    ttl: Duration,
    ttl_skew: Duration,
    fills: Mutex<HashMap<GroupId, Arc<tokio::sync::Mutex<()>>>>,
    last_activity: AtomicI64,
}

impl GroupCache {
    pub fn new(
        cache: Arc<dyn CacheService>,
        source: Arc<dyn MembershipSource>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            cache,
            source,
            max_groups: config.group_cache_max,
            ttl: config.group_cache_ttl,
            ttl_skew: config.group_cache_ttl_skew,
            fills: Mutex::new(HashMap::new()),
            last_activity: AtomicI64::new(0),
        }
    }

    pub async fn members(&self, group: GroupId) -> Result<Vec<GroupMember>, DeliveryError> {
        let key = members_key(group);
        if let Some(members) = self.cached(&key).await? {
            self.touch(group).await?;
            return Ok(members);
        }

        // One fill per group at a time; later callers find the snapshot.
        let gate = self.gate(group);
        let members = {
            let _fill = gate.lock().await;
            match self.cached(&key).await? {
                Some(members) => {
                    self.touch(group).await?;
                    members
                }
                None => {
                    let members = self
                        .source
                        .group_members(group)
                        .await
                        .map_err(DeliveryError::Membership)?;
                    self.fill(group, &key, &members).await?;
                    members
                }
            }
        };
        self.release_gate(group, gate);
        Ok(members)
    }

    pub async fn admins(&self, group: GroupId) -> Result<Vec<GroupMember>, DeliveryError> {
        Ok(self
            .members(group)
            .await?
            .into_iter()
            .filter(|member| member.role.is_admin())
            .collect())
    }

    /// Records a new member in a cached snapshot. Uncached groups are left
    /// for the next lookup to fill.
    pub async fn member_joined(
        &self,
        group: GroupId,
        member: GroupMember,
    ) -> Result<bool, DeliveryError> {
        let key = members_key(group);
        let inserted = self
            .cache
            .insert_if_exists(&key, member.role.score(), &member.user_id.to_string())
            .await?;
        if inserted {
            self.cache.remove_from_sorted_set(&key, EMPTY_SENTINEL).await?;
        }
        Ok(inserted)
    }

    pub async fn member_left(&self, group: GroupId, user: UserId) -> Result<bool, DeliveryError> {
        Ok(self
            .cache
            .remove_from_sorted_set(&members_key(group), &user.to_string())
            .await?)
    }

    pub async fn invalidate(&self, group: GroupId) -> Result<(), DeliveryError> {
        self.cache.remove(&members_key(group)).await?;
        self.cache
            .remove_from_sorted_set(ACTIVE_INDEX_KEY, &group.to_string())
            .await?;
        Ok(())
    }

    /// Cached group ids, least recently used first.
    pub async fn cached_groups(&self) -> Result<Vec<GroupId>, DeliveryError> {
        Ok(self
            .cache
            .range_by_score(ACTIVE_INDEX_KEY, f64::NEG_INFINITY, f64::INFINITY, None)
            .await?
            .into_iter()
            .filter_map(|entry| entry.member.parse().ok().map(GroupId))
            .collect())
    }

    /// `None` on a miss. A snapshot holding only the sentinel is an empty group.
    async fn cached(&self, key: &str) -> Result<Option<Vec<GroupMember>>, DeliveryError> {
        let entries = self
            .cache
            .range_by_score(key, f64::NEG_INFINITY, f64::INFINITY, None)
            .await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let members = entries
            .into_iter()
            .filter(|entry| entry.member != EMPTY_SENTINEL)
            .filter_map(|entry| {
                let user = entry.member.parse().ok().map(UserId);
                let role = Role::from_score(entry.score);
                if user.is_none() || role.is_none() {
                    warn!(key, member = %entry.member, score = entry.score, "malformed group member entry");
                }
                Some(GroupMember {
                    user_id: user?,
                    role: role?,
                })
            })
            .collect();
        Ok(Some(members))
    }

    async fn fill(
        &self,
        group: GroupId,
        key: &str,
        members: &[GroupMember],
    ) -> Result<(), DeliveryError> {
        let entries: Vec<ScoredMember> = if members.is_empty() {
            vec![ScoredMember::new(EMPTY_SENTINEL, EMPTY_SCORE)]
        } else {
            members
                .iter()
                .map(|member| ScoredMember::new(member.user_id.to_string(), member.role.score()))
                .collect()
        };
        self.cache
            .replace_sorted_set(key, &entries, self.jittered_ttl())
            .await?;
        self.touch(group).await?;
        let evicted = self
            .cache
            .evict_least_active(ACTIVE_INDEX_KEY, self.max_groups, MEMBERS_KEY_PREFIX)
            .await?;
        if !evicted.is_empty() {
            debug!(?evicted, "evicted idle group snapshots");
        }
        debug!(%group, members = members.len(), "group snapshot cached");
        Ok(())
    }

    async fn touch(&self, group: GroupId) -> Result<(), DeliveryError> {
        let score = self.next_activity_score();
        self.cache
            .add_to_sorted_set(ACTIVE_INDEX_KEY, score as f64, &group.to_string())
            .await?;
        Ok(())
    }

    /// Wall-clock millis, bumped so that no two accesses share a score.
    fn next_activity_score(&self) -> i64 {
        let now = now_millis();
        let mut previous = self.last_activity.load(Ordering::Relaxed);
        loop {
            let next = now.max(previous + 1);
            match self.last_activity.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    fn jittered_ttl(&self) -> Duration {
        let base = self.ttl.as_millis() as i64;
        let skew = self.ttl_skew.as_millis() as i64;
        let jitter = if skew > 0 {
            rand::thread_rng().gen_range(-skew..=skew)
        } else {
            0
        };
        Duration::from_millis((base + jitter).max(1_000) as u64)
    }

    fn gate(&self, group: GroupId) -> Arc<tokio::sync::Mutex<()>> {
        self.fills.lock().entry(group).or_default().clone()
    }

    fn release_gate(&self, group: GroupId, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut fills = self.fills.lock();
        // The map holds one reference and `gate` another.
        if Arc::strong_count(&gate) <= 2 {
            fills.remove(&group);
        }
    }
}
