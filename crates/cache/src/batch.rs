use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{BatchOp, CacheService, Result};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Buffered op count that triggers an immediate flush.
    pub max_batch: usize,
    /// Upper bound on how long a buffered op waits for a flush.
    pub flush_interval: Duration,
    /// Hard cap on buffered ops. While the backend keeps failing, the oldest
    /// ops beyond the cap are dropped.
    pub max_buffered: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 128,
            flush_interval: Duration::from_millis(50),
            max_buffered: 100_000,
        }
    }
}

/// Shared write pipeline in front of a [`CacheService`].
///
/// Writes are buffered and applied with a single `apply_batch` call, either
/// when the buffer reaches `max_batch` or when the periodic flush fires.
/// Both triggers funnel through one flush-signal queue.
#[derive(Clone)]
pub struct BatchWriter {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Arc<dyn CacheService>,
    config: BatchConfig,
    ops: Mutex<Vec<BatchOp>>,
    flush_tx: mpsc::Sender<()>,
    flushing: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    /// Creates the writer and spawns its flusher on the current runtime.
    pub fn start(cache: Arc<dyn CacheService>, config: BatchConfig) -> Self {
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let inner = Arc::new(Inner {
            cache,
            config,
            ops: Mutex::new(Vec::new()),
            flush_tx,
            flushing: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });
        let writer = Self { inner };
        let handle = tokio::spawn(writer.clone().run(flush_rx));
        *writer.inner.task.lock() = Some(handle);
        writer
    }

    pub fn push(&self, op: BatchOp) {
        let (buffered, dropped) = {
            let mut ops = self.inner.ops.lock();
            ops.push(op);
            let dropped = self.trim_oldest(&mut ops);
            (ops.len(), dropped)
        };
        if dropped > 0 {
            warn!(dropped, buffered, "cache batch buffer full, dropped oldest ops");
        }
        if buffered >= self.inner.config.max_batch {
            // A full queue means a flush is already signalled.
            let _ = self.inner.flush_tx.try_send(());
        }
    }

    /// Drops buffered ops matching `pred` that have not been flushed yet.
    /// Waits out an in-flight flush, so an op that is not retracted has
    /// already reached the cache.
    pub async fn retract(&self, mut pred: impl FnMut(&BatchOp) -> bool) -> usize {
        let _serial = self.inner.flushing.lock().await;
        let mut ops = self.inner.ops.lock();
        let before = ops.len();
        ops.retain(|op| !pred(op));
        before - ops.len()
    }

    pub fn buffered(&self) -> usize {
        self.inner.ops.lock().len()
    }

    /// Applies everything buffered so far. On failure the ops go back to the
    /// front of the buffer so the next flush retries them.
    pub async fn flush(&self) -> Result<usize> {
        let _serial = self.inner.flushing.lock().await;
        let ops = std::mem::take(&mut *self.inner.ops.lock());
        if ops.is_empty() {
            return Ok(0);
        }
        let count = ops.len();
        match self.inner.cache.apply_batch(ops.clone()).await {
            Ok(()) => {
                debug!(count, "flushed cache batch");
                Ok(count)
            }
            Err(error) => {
                let dropped = {
                    let mut buffered = self.inner.ops.lock();
                    let newer = std::mem::replace(&mut *buffered, ops);
                    buffered.extend(newer);
                    self.trim_oldest(&mut buffered)
                };
                if dropped > 0 {
                    warn!(dropped, "cache batch buffer full after failed flush, dropped oldest ops");
                }
                Err(error)
            }
        }
    }

    fn trim_oldest(&self, ops: &mut Vec<BatchOp>) -> usize {
        let overflow = ops.len().saturating_sub(self.inner.config.max_buffered.max(1));
        ops.drain(..overflow);
        overflow
    }

    /// Stops the flusher after a final flush.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(self, mut flush_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.inner.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                Some(()) = flush_rx.recv() => {}
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.flush().await {
                warn!(%error, buffered = self.buffered(), "cache batch flush failed");
            }
        }
        if let Err(error) = self.flush().await {
            warn!(%error, buffered = self.buffered(), "final cache batch flush failed");
        }
    }
}
