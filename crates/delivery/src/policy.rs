use std::sync::Arc;

use cache::CacheService;
use shared::{domain::UserId, protocol::now_millis};
use tracing::{info, warn};

use crate::{bloom::BloomFilterManager, error::DeliveryError};

pub const BANNED_KEY: &str = "policy:banned";
/// Sorted set of muted users scored by mute expiry (unix millis).
pub const MUTED_KEY: &str = "policy:muted";

/// Ban and mute records: exact state in the cache, fronted by the bloom
/// filters so the common "not restricted" answer skips the round trip.
pub struct PolicyStore {
    cache: Arc<dyn CacheService>,
    bloom: Arc<BloomFilterManager>,
}

impl PolicyStore {
    pub fn new(cache: Arc<dyn CacheService>, bloom: Arc<BloomFilterManager>) -> Self {
        Self { cache, bloom }
    }

    pub fn bloom(&self) -> &Arc<BloomFilterManager> {
        &self.bloom
    }

    /// Returns `false` when the user was already banned.
    pub async fn ban(&self, user: UserId) -> Result<bool, DeliveryError> {
        let added = self.cache.add_to_set(BANNED_KEY, &user.to_string()).await?;
        if added {
            self.bloom.ban_user(user);
            info!(%user, "user banned");
        }
        Ok(added)
    }

    pub async fn unban(&self, user: UserId) -> Result<bool, DeliveryError> {
        let removed = self
            .cache
            .remove_from_set(BANNED_KEY, &user.to_string())
            .await?;
        if removed {
            self.bloom.unban_user(user);
            info!(%user, "user unbanned");
        }
        Ok(removed)
    }

    pub async fn is_banned(&self, user: UserId) -> Result<bool, DeliveryError> {
        if !self.bloom.is_banned(user) {
            return Ok(false);
        }
        Ok(self.cache.set_contains(BANNED_KEY, &user.to_string()).await?)
    }

    /// Mutes `user` until `expire_at`. A later call replaces the expiry.
    pub async fn mute(&self, user: UserId, expire_at: i64) -> Result<(), DeliveryError> {
        self.cache
            .add_to_sorted_set(MUTED_KEY, expire_at as f64, &user.to_string())
            .await?;
        if self.bloom.add_mute(user, expire_at) {
            info!(%user, expire_at, "user muted");
        }
        Ok(())
    }

    pub async fn unmute(&self, user: UserId) -> Result<bool, DeliveryError> {
        let removed = self
            .cache
            .remove_from_sorted_set(MUTED_KEY, &user.to_string())
            .await?;
        self.bloom.remove_mute(user);
        if removed {
            info!(%user, "user unmuted");
        }
        Ok(removed)
    }

    pub async fn is_muted(&self, user: UserId) -> Result<bool, DeliveryError> {
        if !self.bloom.is_muted(user) {
            return Ok(false);
        }
        let expire_at = self
            .cache
            .sorted_set_score(MUTED_KEY, &user.to_string())
            .await?;
        Ok(expire_at.is_some_and(|at| at > now_millis() as f64))
    }

    /// Rebuilds the filters from the cached records. Expired mutes are
    /// skipped. Returns `(bans, mutes)` loaded.
    pub async fn warm_up(&self) -> Result<(usize, usize), DeliveryError> {
        let mut bans = 0;
        for raw in self.cache.set_members(BANNED_KEY).await? {
            match raw.parse::<i64>() {
                Ok(id) => {
                    self.bloom.ban_user(UserId(id));
                    bans += 1;
                }
                Err(_) => warn!(member = %raw, "skipping malformed ban record"),
            }
        }

        let now = now_millis() as f64;
        let mut mutes = 0;
        for entry in self
            .cache
            .range_by_score(MUTED_KEY, now, f64::INFINITY, None)
            .await?
        {
            match entry.member.parse::<i64>() {
                Ok(id) => {
                    if self.bloom.add_mute(UserId(id), entry.score as i64) {
                        mutes += 1;
                    }
                }
                Err(_) => warn!(member = %entry.member, "skipping malformed mute record"),
            }
        }
        info!(bans, mutes, "policy filters warmed up");
        Ok((bans, mutes))
    }

    /// Loads durable records into the cache and filters. Records already
    /// present in the cache are left alone.
    pub async fn seed(
        &self,
        bans: &[UserId],
        mutes: &[(UserId, i64)],
    ) -> Result<(), DeliveryError> {
        for user in bans {
            self.ban(*user).await?;
        }
        let muted: Vec<String> = self
            .cache
            .range_by_score(MUTED_KEY, f64::NEG_INFINITY, f64::INFINITY, None)
            .await?
            .into_iter()
            .map(|entry| entry.member)
            .collect();
        for (user, expire_at) in mutes {
            if !muted.contains(&user.to_string()) {
                self.mute(*user, *expire_at).await?;
            }
        }
        Ok(())
    }
}
