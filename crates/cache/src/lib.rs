//! Contract for the external key/value cache the delivery core keeps its
//! durable state in: offline sets, the pending-ack sorted set, ban/mute
//! records and group-member snapshots.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod batch;
mod memory;
#[cfg(feature = "redis")]
mod redis_cache;

pub use batch::{BatchConfig, BatchWriter};
pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache payload could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("key {0} holds a value of another type")]
    WrongType(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// A write that may be buffered and applied later as part of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    SortedSetAdd {
        key: String,
        score: f64,
        member: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool>;
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn add_to_sorted_set(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn remove_from_sorted_set(&self, key: &str, member: &str) -> Result<bool>;
    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn sorted_set_len(&self, key: &str) -> Result<usize>;
    /// Members with `min <= score <= max`, lowest score first.
    async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>>;

    /// Applies buffered writes in one round trip.
    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Adds to a sorted set only when the key already exists.
    async fn insert_if_exists(&self, key: &str, score: f64, member: &str) -> Result<bool>;

    /// Atomically replaces the whole sorted set and sets its TTL.
    async fn replace_sorted_set(
        &self,
        key: &str,
        entries: &[ScoredMember],
        ttl: Duration,
    ) -> Result<()>;

    /// Removes the members stored at exactly `score` whose JSON object has
    /// every `(field, value)` pair in `fields`. Returns how many were removed.
    async fn remove_scored_matching(
        &self,
        key: &str,
        score: f64,
        fields: &[(&str, &str)],
    ) -> Result<usize>;

    /// Trims the index sorted set down to `max_entries`, dropping the lowest
    /// scores first, and deletes `prefix + member` for every evicted member.
    async fn evict_least_active(
        &self,
        index_key: &str,
        max_entries: usize,
        prefix: &str,
    ) -> Result<Vec<String>>;
}

/// True when every `(field, value)` pair matches the decoded JSON object.
/// String fields compare by content, anything else by its JSON rendering.
pub(crate) fn member_matches(member: &str, fields: &[(&str, &str)]) -> bool {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(member)
    else {
        return false;
    };
    fields.iter().all(|(field, expected)| match map.get(*field) {
        Some(serde_json::Value::String(actual)) => actual == expected,
        Some(other) => other.to_string() == *expected,
        None => false,
    })
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod memory_tests;

#[cfg(test)]
#[path = "tests/batch_tests.rs"]
mod batch_tests;
