use std::time::Duration;

use cache::BatchConfig;

/// Tuning knobs for the delivery core.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Capacity of each hub intake queue.
    pub intake_capacity: usize,
    /// Capacity of a connection's private send queue. A full queue sends the
    /// message to the offline store instead.
    pub send_queue_capacity: usize,
    pub write_retries: usize,
    pub write_retry_delay: Duration,

    /// Pending entries older than this are picked up by the resend loop.
    pub ack_timeout: Duration,
    pub resend_interval: Duration,
    /// Stale entries handled per resend pass; a larger backlog schedules the
    /// next pass after `resend_fast_delay`.
    pub resend_batch_size: usize,
    pub resend_fast_delay: Duration,
    pub store_max_retries: u32,
    pub store_retry_base: Duration,

    pub group_cache_max: usize,
    pub group_cache_ttl: Duration,
    pub group_cache_ttl_skew: Duration,

    /// Counter slots per bloom filter.
    pub bloom_size: usize,
    pub mute_idle_sleep: Duration,
    pub mute_max_sleep: Duration,

    /// How long `Hub::stop` waits for connections to drain.
    pub shutdown_timeout: Duration,
    pub batch: BatchConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 1024,
            send_queue_capacity: 256,
            write_retries: 3,
            write_retry_delay: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(10),
            resend_interval: Duration::from_secs(5),
            resend_batch_size: 200,
            resend_fast_delay: Duration::from_millis(10),
            store_max_retries: 3,
            store_retry_base: Duration::from_millis(50),
            group_cache_max: 1000,
            group_cache_ttl: Duration::from_secs(30 * 60),
            group_cache_ttl_skew: Duration::from_secs(5 * 60),
            bloom_size: 1 << 20,
            mute_idle_sleep: Duration::from_secs(60 * 60),
            mute_max_sleep: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            batch: BatchConfig::default(),
        }
    }
}
