use std::{sync::Arc, time::Duration};

use cache::{BatchOp, BatchWriter, CacheService};
use rand::Rng;
use serde::{Deserialize, Serialize};
use shared::{domain::UserId, protocol::Message};
use tracing::warn;

use crate::{config::DeliveryConfig, error::DeliveryError};

/// Sorted set of messages awaiting an Ack, scored by message time.
pub const PENDING_KEY: &str = "pending:messages";
pub const OFFLINE_KEY_PREFIX: &str = "offline:";

pub fn offline_key(user: UserId) -> String {
    format!("{OFFLINE_KEY_PREFIX}{user}")
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingRecord {
    id: String,
    recipient: String,
    message: Message,
}

/// A live delivery still waiting for the recipient's Ack.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub recipient: UserId,
    pub message: Message,
    pub score: f64,
}

/// A message parked for a recipient that was not connected. `raw` is the
/// stored member, needed to remove it again.
#[derive(Debug, Clone)]
pub struct OfflineEntry {
    pub raw: String,
    pub message: Message,
}

/// Cache-backed offline and pending-ack storage.
pub struct MessageStore {
    cache: Arc<dyn CacheService>,
    batch: BatchWriter,
    max_retries: u32,
    retry_base: Duration,
}

impl MessageStore {
    pub fn new(cache: Arc<dyn CacheService>, batch: BatchWriter, config: &DeliveryConfig) -> Self {
        Self {
            cache,
            batch,
            max_retries: config.store_max_retries,
            retry_base: config.store_retry_base,
        }
    }

    /// Queues a pending record on the batch writer.
    pub fn track_pending(&self, recipient: UserId, message: &Message) -> Result<(), DeliveryError> {
        let record = PendingRecord {
            id: message.id.clone(),
            recipient: recipient.to_string(),
            message: message.clone(),
        };
        self.batch.push(BatchOp::SortedSetAdd {
            key: PENDING_KEY.to_string(),
            score: message.time as f64,
            member: serde_json::to_string(&record)?,
        });
        Ok(())
    }

    /// Drops the pending record for `(id, recipient)` stored at `score`.
    /// A record that was never flushed is retracted from the batch buffer.
    pub async fn remove_pending(
        &self,
        id: &str,
        recipient: UserId,
        score: f64,
    ) -> Result<bool, DeliveryError> {
        let recipient = recipient.to_string();
        let retracted = self
            .batch
            .retract(|op| match op {
                BatchOp::SortedSetAdd {
                    key,
                    score: queued,
                    member,
                } => key == PENDING_KEY && *queued == score && is_record(member, id, &recipient),
                _ => false,
            })
            .await;
        if retracted > 0 {
            return Ok(true);
        }

        let fields = [("id", id), ("recipient", recipient.as_str())];
        let mut attempt = 0;
        loop {
            match self
                .cache
                .remove_scored_matching(PENDING_KEY, score, &fields)
                .await
            {
                Ok(removed) => return Ok(removed > 0),
                Err(error) if attempt < self.max_retries => {
                    warn!(%error, id, attempt, "pending removal failed, retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Pending records with a score at or below `cutoff`, oldest first.
    /// Records that no longer decode are dropped.
    pub async fn stale_pending(
        &self,
        cutoff: f64,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, DeliveryError> {
        let rows = self
            .cache
            .range_by_score(PENDING_KEY, f64::NEG_INFINITY, cutoff, Some(limit))
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let decoded = serde_json::from_str::<PendingRecord>(&row.member)
                .ok()
                .and_then(|record| {
                    let recipient = record.recipient.parse().ok().map(UserId)?;
                    Some(PendingEntry {
                        recipient,
                        message: record.message,
                        score: row.score,
                    })
                });
            match decoded {
                Some(entry) => entries.push(entry),
                None => {
                    warn!(member = %row.member, "dropping undecodable pending record");
                    self.cache
                        .remove_from_sorted_set(PENDING_KEY, &row.member)
                        .await?;
                }
            }
        }
        Ok(entries)
    }

    pub async fn pending_len(&self) -> Result<usize, DeliveryError> {
        Ok(self.cache.sorted_set_len(PENDING_KEY).await?)
    }

    pub async fn store_offline(&self, user: UserId, message: &Message) -> Result<(), DeliveryError> {
        let raw = serde_json::to_string(message)?;
        self.cache.add_to_set(&offline_key(user), &raw).await?;
        Ok(())
    }

    /// Everything parked for `user`, oldest first.
    pub async fn offline_messages(&self, user: UserId) -> Result<Vec<OfflineEntry>, DeliveryError> {
        let key = offline_key(user);
        let mut entries = Vec::new();
        for raw in self.cache.set_members(&key).await? {
            match serde_json::from_str::<Message>(&raw) {
                Ok(message) => entries.push(OfflineEntry { raw, message }),
                Err(error) => {
                    warn!(%user, %error, "dropping undecodable offline message");
                    self.cache.remove_from_set(&key, &raw).await?;
                }
            }
        }
        entries.sort_by(|a, b| a.message.time.cmp(&b.message.time));
        Ok(entries)
    }

    pub async fn remove_offline(
        &self,
        user: UserId,
        entry: &OfflineEntry,
    ) -> Result<bool, DeliveryError> {
        Ok(self
            .cache
            .remove_from_set(&offline_key(user), &entry.raw)
            .await?)
    }

    pub async fn flush(&self) -> Result<usize, DeliveryError> {
        Ok(self.batch.flush().await?)
    }

    pub async fn shutdown(&self) {
        self.batch.shutdown().await;
    }

    /// Exponential backoff with +/-50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_base.saturating_mul(1 << attempt.min(16));
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        base.mul_f64(factor)
    }
}

fn is_record(member: &str, id: &str, recipient: &str) -> bool {
    serde_json::from_str::<PendingRecord>(member)
        .is_ok_and(|record| record.id == id && record.recipient == recipient)
}
