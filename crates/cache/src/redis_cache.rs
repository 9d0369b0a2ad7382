use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client, Script};
use tracing::info;

use crate::{BatchOp, CacheError, CacheService, Result, ScoredMember};

const INSERT_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

const REPLACE_SORTED_SET: &str = r#"
redis.call('DEL', KEYS[1])
for i = 2, #ARGV, 2 do
  redis.call('ZADD', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return 1
"#;

const REMOVE_SCORED_MATCHING: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[1])
local removed = 0
for _, member in ipairs(members) do
  local ok, decoded = pcall(cjson.decode, member)
  if ok and type(decoded) == 'table' then
    local matched = true
    for i = 2, #ARGV, 2 do
      if tostring(decoded[ARGV[i]]) ~= ARGV[i + 1] then
        matched = false
        break
      end
    end
    if matched then
      removed = removed + redis.call('ZREM', KEYS[1], member)
    end
  end
end
return removed
"#;

const EVICT_LEAST_ACTIVE: &str = r#"
local count = redis.call('ZCARD', KEYS[1])
local limit = tonumber(ARGV[1])
if count <= limit then
  return {}
end
local victims = redis.call('ZRANGE', KEYS[1], 0, count - limit - 1)
for _, id in ipairs(victims) do
  redis.call('DEL', ARGV[2] .. id)
  redis.call('ZREM', KEYS[1], id)
end
return victims
"#;

impl From<redis::RedisError> for CacheError {
    fn from(value: redis::RedisError) -> Self {
        CacheError::Backend(value.to_string())
    }
}

/// Redis-backed cache; scripted operations run as Lua so each is atomic.
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
    insert_if_exists: Script,
    replace_sorted_set: Script,
    remove_scored_matching: Script,
    evict_least_active: Script,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(%url, "connected to redis cache");
        Ok(Self {
            conn,
            insert_if_exists: Script::new(INSERT_IF_EXISTS),
            replace_sorted_set: Script::new(REPLACE_SORTED_SET),
            remove_scored_matching: Script::new(REMOVE_SCORED_MATCHING),
            evict_least_active: Script::new(EVICT_LEAST_ACTIVE),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn score_bound(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl CacheService for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let found: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(found == 1)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn add_to_sorted_set(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_from_sorted_set(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn();
        let len: usize = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredMember>> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key)
            .arg(score_bound(min))
            .arg(score_bound(max))
            .arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        let rows: Vec<(String, f64)> = cmd.query_async(&mut conn).await?;
        Ok(rows
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                BatchOp::SortedSetAdd { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
                }
                BatchOp::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                BatchOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn insert_if_exists(&self, key: &str, score: f64, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let inserted: i64 = self
            .insert_if_exists
            .key(key)
            .arg(score)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn replace_sorted_set(
        &self,
        key: &str,
        entries: &[ScoredMember],
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn();
        let mut invocation = self.replace_sorted_set.prepare_invoke();
        invocation.key(key).arg(millis(ttl));
        for entry in entries {
            invocation.arg(entry.score).arg(&entry.member);
        }
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_scored_matching(
        &self,
        key: &str,
        score: f64,
        fields: &[(&str, &str)],
    ) -> Result<usize> {
        let mut conn = self.conn();
        let mut invocation = self.remove_scored_matching.prepare_invoke();
        invocation.key(key).arg(score_bound(score));
        for (field, value) in fields {
            invocation.arg(*field).arg(*value);
        }
        let removed: usize = invocation.invoke_async(&mut conn).await?;
        Ok(removed)
    }

    async fn evict_least_active(
        &self,
        index_key: &str,
        max_entries: usize,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let victims: Vec<String> = self
            .evict_least_active
            .key(index_key)
            .arg(max_entries)
            .arg(prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(victims)
    }
}
