//! Counting bloom filters used to short-circuit ban and mute lookups.
//!
//! A negative answer is definitive. A positive answer only means "maybe" and
//! must be confirmed against the exact record in the cache.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use shared::{domain::UserId, protocol::now_millis};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DeliveryConfig;

const HASH_SEEDS: [[u64; 4]; 3] = [
    [0x243f_6a88_85a3_08d3, 0x1319_8a2e_0370_7344, 0xa409_3822_299f_31d0, 0x082e_fa98_ec4e_6c89],
    [0x4528_21e6_38d0_1377, 0xbe54_66cf_34e9_0c6c, 0xc0ac_29b7_c97c_50dd, 0x3f84_d5b5_b547_0917],
    [0x9216_d5d9_8979_fb1b, 0xd131_0ba6_98df_b5ac, 0x2ffd_72db_d01a_dfb7, 0xb8e1_afed_6a26_7e96],
];

const BANNED_SEED: u64 = 0x6261_6e6e_6564;
const MUTED_SEED: u64 = 0x6d75_7465_64;

/// Bloom filter with 8-bit counters so entries can be removed again.
///
/// A counter that reaches `u8::MAX` sticks there: decrementing it could
/// produce a false negative for another key sharing the slot.
pub struct CountingBloomFilter {
    counters: RwLock<Vec<u8>>,
    hashers: [RandomState; 3],
}

impl CountingBloomFilter {
    /// `seed` is mixed into each of the three hashers, so filters built with
    /// different seeds spread the same key differently.
    pub fn new(size: usize, seed: u64) -> Self {
        let hashers = HASH_SEEDS
            .map(|[a, b, c, d]| RandomState::with_seeds(a ^ seed, b, c, d.rotate_left(seed as u32 % 64)));
        Self {
            counters: RwLock::new(vec![0; size.max(1)]),
            hashers,
        }
    }

    fn slots<K: Hash>(&self, key: &K, len: usize) -> [usize; 3] {
        let mut slots = [0; 3];
        for (slot, hasher) in slots.iter_mut().zip(&self.hashers) {
            *slot = (hasher.hash_one(key) % len as u64) as usize;
        }
        slots
    }

    pub fn add<K: Hash>(&self, key: &K) {
        let mut counters = self.counters.write();
        let len = counters.len();
        for slot in self.slots(key, len) {
            let counter = &mut counters[slot];
            *counter = counter.saturating_add(1);
        }
    }

    pub fn remove<K: Hash>(&self, key: &K) {
        let mut counters = self.counters.write();
        let len = counters.len();
        for slot in self.slots(key, len) {
            let counter = &mut counters[slot];
            if *counter > 0 && *counter < u8::MAX {
                *counter -= 1;
            }
        }
    }

    pub fn contains<K: Hash>(&self, key: &K) -> bool {
        let counters = self.counters.read();
        let len = counters.len();
        self.slots(key, len)
            .into_iter()
            .all(|slot| counters[slot] > 0)
    }
}

/// A mute that drops out of the filter at `expire_at` (unix millis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MuteExpiry {
    pub expire_at: i64,
    pub user: UserId,
}

/// Owns the ban and mute filters plus the worker that retires expired mutes.
pub struct BloomFilterManager {
    banned: CountingBloomFilter,
    muted: CountingBloomFilter,
    expiries: Mutex<BinaryHeap<Reverse<MuteExpiry>>>,
    wake: Notify,
    idle_sleep: Duration,
    max_sleep: Duration,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BloomFilterManager {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            banned: CountingBloomFilter::new(config.bloom_size, BANNED_SEED),
            muted: CountingBloomFilter::new(config.bloom_size, MUTED_SEED),
            expiries: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            idle_sleep: config.mute_idle_sleep,
            max_sleep: config.mute_max_sleep,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the mute-expiry worker. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_none() && !self.shutdown.is_cancelled() {
            *worker = Some(tokio::spawn(self.clone().run_expiry_worker()));
        }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn ban_user(&self, user: UserId) {
        self.banned.add(&user);
    }

    pub fn unban_user(&self, user: UserId) {
        self.banned.remove(&user);
    }

    pub fn is_banned(&self, user: UserId) -> bool {
        self.banned.contains(&user)
    }

    /// Adds a timed mute. Mutes already past their expiry are ignored.
    pub fn add_mute(&self, user: UserId, expire_at: i64) -> bool {
        if expire_at <= now_millis() {
            return false;
        }
        self.muted.add(&user);
        let earliest = {
            let mut heap = self.expiries.lock();
            heap.push(Reverse(MuteExpiry { expire_at, user }));
            heap.peek().is_some_and(|Reverse(head)| head.user == user && head.expire_at == expire_at)
        };
        if earliest {
            self.wake.notify_one();
        }
        true
    }

    /// Lifts every pending mute for `user` before it expires.
    pub fn remove_mute(&self, user: UserId) -> usize {
        let removed = {
            let mut heap = self.expiries.lock();
            let before = heap.len();
            heap.retain(|Reverse(entry)| entry.user != user);
            before - heap.len()
        };
        for _ in 0..removed {
            self.muted.remove(&user);
        }
        removed
    }

    pub fn is_muted(&self, user: UserId) -> bool {
        self.muted.contains(&user)
    }

    pub fn pending_expiries(&self) -> usize {
        self.expiries.lock().len()
    }

    async fn run_expiry_worker(self: Arc<Self>) {
        info!("mute expiry worker started");
        loop {
            let head = self.expiries.lock().peek().map(|Reverse(entry)| *entry);
            let sleep_for = match head {
                None => self.idle_sleep,
                Some(entry) => {
                    let now = now_millis();
                    if entry.expire_at <= now {
                        self.retire(entry);
                        continue;
                    }
                    Duration::from_millis((entry.expire_at - now) as u64).min(self.max_sleep)
                }
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("mute expiry worker stopped");
    }

    fn retire(&self, entry: MuteExpiry) {
        let popped = {
            let mut heap = self.expiries.lock();
            match heap.peek() {
                Some(Reverse(head)) if *head == entry => heap.pop(),
                _ => None,
            }
        };
        if popped.is_some() {
            self.muted.remove(&entry.user);
            debug!(user = %entry.user, "mute expired");
        }
    }
}
