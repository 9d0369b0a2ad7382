use std::{sync::Arc, time::Duration};

use shared::protocol::now_millis;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::DeliveryConfig,
    error::DeliveryError,
    pipeline::DirectSend,
    store::{MessageStore, PendingEntry},
};

/// Retries deliveries whose Ack never arrived.
pub struct ResendLoop {
    store: Arc<MessageStore>,
    direct: Arc<DirectSend>,
    ack_timeout: Duration,
    interval: Duration,
    batch_size: usize,
    fast_delay: Duration,
}

impl ResendLoop {
    pub fn new(store: Arc<MessageStore>, direct: Arc<DirectSend>, config: &DeliveryConfig) -> Self {
        Self {
            store,
            direct,
            ack_timeout: config.ack_timeout,
            interval: config.resend_interval,
            batch_size: config.resend_batch_size.max(1),
            fast_delay: config.resend_fast_delay,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "resend loop started");
        let mut delay = self.interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = match self.tick().await {
                Ok(true) => self.fast_delay,
                Ok(false) => self.interval,
                Err(error) => {
                    warn!(%error, "resend pass failed");
                    self.interval
                }
            };
        }
        info!("resend loop stopped");
    }

    /// One pass over stale pending entries. Returns `true` when more stale
    /// entries remain than one pass handles.
    pub async fn tick(&self) -> Result<bool, DeliveryError> {
        let cutoff = now_millis() - self.ack_timeout.as_millis() as i64;
        let stale = self
            .store
            .stale_pending(cutoff as f64, self.batch_size + 1)
            .await?;
        let backlog = stale.len() > self.batch_size;
        let mut handled = 0;
        for entry in stale.into_iter().take(self.batch_size) {
            if self.resend(entry).await {
                handled += 1;
            }
        }
        if handled > 0 {
            debug!(handled, backlog, "resend pass finished");
        }
        Ok(backlog)
    }

    /// A live resend or a move to the offline store both confirm the entry,
    /// which is then dropped from the pending set.
    async fn resend(&self, entry: PendingEntry) -> bool {
        let PendingEntry {
            recipient,
            message,
            score,
        } = entry;
        if !message.kind.is_tracked() {
            debug!(id = %message.id, "dropping untracked kind from pending set");
        } else if self.direct.deliver_live(recipient, message.clone()) {
            debug!(%recipient, id = %message.id, "resent unacknowledged message");
        } else if message.kind.is_cacheable() {
            if let Err(error) = self.store.store_offline(recipient, &message).await {
                warn!(%recipient, id = %message.id, %error, "failed to move pending message offline");
                return false;
            }
            debug!(%recipient, id = %message.id, "moved unacknowledged message offline");
        }

        match self.store.remove_pending(&message.id, recipient, score).await {
            Ok(_) => true,
            Err(error) => {
                warn!(%recipient, id = %message.id, %error, "failed to clear pending entry");
                false
            }
        }
    }
}
