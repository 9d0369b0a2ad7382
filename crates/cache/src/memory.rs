use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{member_matches, BatchOp, CacheError, CacheService, Result, ScoredMember};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local cache backend. Expired keys are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn set_mut<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Result<&'a mut HashSet<String>> {
        if Self::live(entries, key).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::Set(HashSet::new())));
        }
        match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(Value::Set(set)) => Ok(set),
            _ => Err(CacheError::WrongType(key.to_string())),
        }
    }

    fn zset_mut<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Result<&'a mut HashMap<String, f64>> {
        if Self::live(entries, key).is_none() {
            entries.insert(
                key.to_string(),
                Entry::new(Value::SortedSet(HashMap::new())),
            );
        }
        match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(Value::SortedSet(zset)) => Ok(zset),
            _ => Err(CacheError::WrongType(key.to_string())),
        }
    }

    fn zset_ref<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Result<Option<&'a mut HashMap<String, f64>>> {
        match Self::live(entries, key).map(|entry| &mut entry.value) {
            None => Ok(None),
            Some(Value::SortedSet(zset)) => Ok(Some(zset)),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    /// Empty collections disappear, as they do in Redis.
    fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
        let empty = match entries.get(key).map(|entry| &entry.value) {
            Some(Value::Set(set)) => set.is_empty(),
            Some(Value::SortedSet(zset)) => zset.is_empty(),
            _ => false,
        };
        if empty {
            entries.remove(key);
        }
    }

    fn sorted(zset: &HashMap<String, f64>) -> Vec<ScoredMember> {
        let mut members: Vec<ScoredMember> = zset
            .iter()
            .map(|(member, score)| ScoredMember::new(member.clone(), *score))
            .collect();
        members.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.member.cmp(&b.member))
        });
        members
    }

    fn apply_one(entries: &mut HashMap<String, Entry>, op: BatchOp) -> Result<()> {
        match op {
            BatchOp::SortedSetAdd { key, score, member } => {
                Self::zset_mut(entries, &key)?.insert(member, score);
            }
            BatchOp::SetAdd { key, member } => {
                Self::set_mut(entries, &key)?.insert(member);
            }
            BatchOp::Expire { key, ttl } => {
                if let Some(entry) = Self::live(entries, &key) {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheService for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).is_some() && entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        Ok(Self::set_mut(&mut entries, key)?.insert(member.to_string()))
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let removed = match Self::live(&mut entries, key).map(|entry| &mut entry.value) {
            None => false,
            Some(Value::Set(set)) => set.remove(member),
            Some(_) => return Err(CacheError::WrongType(key.to_string())),
        };
        Self::drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        match Self::live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn add_to_sorted_set(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        Self::zset_mut(&mut entries, key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn remove_from_sorted_set(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let removed = match Self::zset_ref(&mut entries, key)? {
            Some(zset) => zset.remove(member).is_some(),
            None => false,
        };
        Self::drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut entries = self.entries.lock();
        Ok(Self::zset_ref(&mut entries, key)?.and_then(|zset| zset.get(member).copied()))
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize> {
        let mut entries = self.entries.lock();
        Ok(Self::zset_ref(&mut entries, key)?.map_or(0, |zset| zset.len()))
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        let mut entries = self.entries.lock();
        let Some(zset) = Self::zset_ref(&mut entries, key)? else {
            return Ok(Vec::new());
        };
        let in_range = Self::sorted(zset)
            .into_iter()
            .filter(|entry| entry.score >= min && entry.score <= max);
        Ok(match limit {
            Some(limit) => in_range.take(limit).collect(),
            None => in_range.collect(),
        })
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut entries = self.entries.lock();
        for op in ops {
            Self::apply_one(&mut entries, op)?;
        }
        Ok(())
    }

    async fn insert_if_exists(&self, key: &str, score: f64, member: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match Self::zset_ref(&mut entries, key)? {
            Some(zset) => {
                zset.insert(member.to_string(), score);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replace_sorted_set(
        &self,
        key: &str,
        entries_in: &[ScoredMember],
        ttl: Duration,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        let zset = entries_in
            .iter()
            .map(|entry| (entry.member.clone(), entry.score))
            .collect();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::SortedSet(zset),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove_scored_matching(
        &self,
        key: &str,
        score: f64,
        fields: &[(&str, &str)],
    ) -> Result<usize> {
        let mut entries = self.entries.lock();
        let removed = match Self::zset_ref(&mut entries, key)? {
            Some(zset) => {
                let before = zset.len();
                zset.retain(|member, stored| {
                    !(*stored == score && member_matches(member, fields))
                });
                before - zset.len()
            }
            None => 0,
        };
        Self::drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn evict_least_active(
        &self,
        index_key: &str,
        max_entries: usize,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        let victims: Vec<String> = match Self::zset_ref(&mut entries, index_key)? {
            Some(index) if index.len() > max_entries => {
                let overflow = index.len() - max_entries;
                let victims: Vec<String> = Self::sorted(index)
                    .into_iter()
                    .take(overflow)
                    .map(|entry| entry.member)
                    .collect();
                for victim in &victims {
                    index.remove(victim);
                }
                victims
            }
            _ => return Ok(Vec::new()),
        };
        for victim in &victims {
            entries.remove(&format!("{prefix}{victim}"));
        }
        Self::drop_if_empty(&mut entries, index_key);
        Ok(victims)
    }
}
