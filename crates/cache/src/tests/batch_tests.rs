use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::*;

/// Memory cache whose batch writes fail while `down` is set.
#[derive(Default)]
struct FlakyCache {
    inner: MemoryCache,
    down: AtomicBool,
}

#[async_trait]
impl CacheService for FlakyCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }
    async fn remove(&self, key: &str) -> Result<bool> {
        self.inner.remove(key).await
    }
    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.expire(key, ttl).await
    }
    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.add_to_set(key, member).await
    }
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.remove_from_set(key, member).await
    }
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.set_contains(key, member).await
    }
    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.inner.set_members(key).await
    }
    async fn add_to_sorted_set(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.inner.add_to_sorted_set(key, score, member).await
    }
    async fn remove_from_sorted_set(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.remove_from_sorted_set(key, member).await
    }
    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.inner.sorted_set_score(key, member).await
    }
    async fn sorted_set_len(&self, key: &str) -> Result<usize> {
        self.inner.sorted_set_len(key).await
    }
    async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        self.inner.range_by_score(key, min, max, limit).await
    }
    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("connection refused".to_string()));
        }
        self.inner.apply_batch(ops).await
    }
    async fn insert_if_exists(&self, key: &str, score: f64, member: &str) -> Result<bool> {
        self.inner.insert_if_exists(key, score, member).await
    }
    async fn replace_sorted_set(
        &self,
        key: &str,
        entries: &[ScoredMember],
        ttl: Duration,
    ) -> Result<()> {
        self.inner.replace_sorted_set(key, entries, ttl).await
    }
    async fn remove_scored_matching(
        &self,
        key: &str,
        score: f64,
        fields: &[(&str, &str)],
    ) -> Result<usize> {
        self.inner.remove_scored_matching(key, score, fields).await
    }
    async fn evict_least_active(
        &self,
        index_key: &str,
        max_entries: usize,
        prefix: &str,
    ) -> Result<Vec<String>> {
        self.inner.evict_least_active(index_key, max_entries, prefix).await
    }
}

fn zadd(member: &str, score: f64) -> BatchOp {
    BatchOp::SortedSetAdd {
        key: "pending".to_string(),
        score,
        member: member.to_string(),
    }
}

#[tokio::test]
async fn reaching_max_batch_triggers_flush() {
    let cache = Arc::new(MemoryCache::new());
    let writer = BatchWriter::start(
        cache.clone(),
        BatchConfig {
            max_batch: 3,
            flush_interval: Duration::from_secs(3600),
            ..BatchConfig::default()
        },
    );

    writer.push(zadd("a", 1.0));
    writer.push(zadd("b", 2.0));
    assert_eq!(writer.buffered(), 2);
    writer.push(zadd("c", 3.0));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while cache.sorted_set_len("pending").await.expect("len") < 3 {
        assert!(tokio::time::Instant::now() < deadline, "count flush never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(writer.buffered(), 0);
    writer.shutdown().await;
}

#[tokio::test]
async fn interval_flushes_small_batches() {
    let cache = Arc::new(MemoryCache::new());
    let writer = BatchWriter::start(
        cache.clone(),
        BatchConfig {
            max_batch: 1000,
            flush_interval: Duration::from_millis(20),
            ..BatchConfig::default()
        },
    );
    writer.push(BatchOp::SetAdd {
        key: "offline:9".to_string(),
        member: "hello".to_string(),
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cache.set_contains("offline:9", "hello").await.expect("sismember"));
    writer.shutdown().await;
}

#[tokio::test]
async fn retracted_ops_never_reach_the_cache() {
    let cache = Arc::new(MemoryCache::new());
    let writer = BatchWriter::start(
        cache.clone(),
        BatchConfig {
            max_batch: 1000,
            flush_interval: Duration::from_secs(3600),
            ..BatchConfig::default()
        },
    );
    writer.push(zadd("keep", 1.0));
    writer.push(zadd("drop", 2.0));

    let retracted = writer
        .retract(|op| matches!(op, BatchOp::SortedSetAdd { member, .. } if member == "drop"))
        .await;
    assert_eq!(retracted, 1);
    assert_eq!(writer.flush().await.expect("flush"), 1);

    let members: Vec<String> = cache
        .range_by_score("pending", f64::NEG_INFINITY, f64::INFINITY, None)
        .await
        .expect("range")
        .into_iter()
        .map(|m| m.member)
        .collect();
    assert_eq!(members, vec!["keep".to_string()]);
    writer.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_what_is_left() {
    let cache = Arc::new(MemoryCache::new());
    let writer = BatchWriter::start(
        cache.clone(),
        BatchConfig {
            max_batch: 1000,
            flush_interval: Duration::from_secs(3600),
            ..BatchConfig::default()
        },
    );
    writer.push(zadd("late", 5.0));
    writer.shutdown().await;
    assert_eq!(cache.sorted_set_len("pending").await.expect("len"), 1);
}

#[tokio::test]
async fn failed_flush_keeps_ops_up_to_the_cap() {
    let cache = Arc::new(FlakyCache::default());
    cache.down.store(true, Ordering::SeqCst);
    let writer = BatchWriter::start(
        cache.clone(),
        BatchConfig {
            max_batch: 1000,
            flush_interval: Duration::from_secs(3600),
            max_buffered: 3,
        },
    );

    writer.push(zadd("a", 1.0));
    writer.push(zadd("b", 2.0));
    assert!(writer.flush().await.is_err());
    assert_eq!(writer.buffered(), 2);

    writer.push(zadd("c", 3.0));
    writer.push(zadd("d", 4.0));
    assert_eq!(writer.buffered(), 3);
    assert!(writer.flush().await.is_err());
    assert_eq!(writer.buffered(), 3);

    cache.down.store(false, Ordering::SeqCst);
    assert_eq!(writer.flush().await.expect("flush"), 3);
    let members: Vec<String> = cache
        .range_by_score("pending", f64::NEG_INFINITY, f64::INFINITY, None)
        .await
        .expect("range")
        .into_iter()
        .map(|m| m.member)
        .collect();
    assert_eq!(members, vec!["b", "c", "d"]);
    writer.shutdown().await;
}
