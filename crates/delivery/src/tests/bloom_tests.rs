use std::{sync::Arc, time::Duration};

use shared::{domain::UserId, protocol::now_millis};

use crate::{
    bloom::{BloomFilterManager, CountingBloomFilter},
    config::DeliveryConfig,
};

fn manager(config: DeliveryConfig) -> Arc<BloomFilterManager> {
    let manager = Arc::new(BloomFilterManager::new(&config));
    manager.start();
    manager
}

#[test]
fn n_bans_need_n_unbans() {
    let bloom = BloomFilterManager::new(&DeliveryConfig::default());
    let user = UserId(42);
    for _ in 0..3 {
        bloom.ban_user(user);
    }
    bloom.unban_user(user);
    bloom.unban_user(user);
    assert!(bloom.is_banned(user));
    bloom.unban_user(user);
    assert!(!bloom.is_banned(user));
}

#[test]
fn removing_a_key_leaves_others_in_place() {
    let filter = CountingBloomFilter::new(1 << 16, 7);
    filter.add(&UserId(1));
    filter.add(&UserId(2));
    filter.remove(&UserId(1));
    assert!(!filter.contains(&UserId(1)));
    assert!(filter.contains(&UserId(2)));
}

#[test]
fn saturated_counters_are_never_decremented() {
    // A single slot: every key lands on the same counter.
    let filter = CountingBloomFilter::new(1, 0);
    for _ in 0..300 {
        filter.add(&UserId(9));
    }
    for _ in 0..300 {
        filter.remove(&UserId(9));
    }
    assert!(filter.contains(&UserId(9)));
}

#[test]
fn mutes_already_expired_are_ignored() {
    let bloom = BloomFilterManager::new(&DeliveryConfig::default());
    assert!(!bloom.add_mute(UserId(3), now_millis() - 1));
    assert!(!bloom.is_muted(UserId(3)));
    assert_eq!(bloom.pending_expiries(), 0);
}

#[test]
fn remove_mute_lifts_every_pending_mute() {
    let bloom = BloomFilterManager::new(&DeliveryConfig::default());
    let user = UserId(5);
    let until = now_millis() + 60_000;
    assert!(bloom.add_mute(user, until));
    assert!(bloom.add_mute(user, until + 1_000));
    assert_eq!(bloom.remove_mute(user), 2);
    assert!(!bloom.is_muted(user));
    assert_eq!(bloom.pending_expiries(), 0);
}

#[tokio::test]
async fn mute_clears_after_expiry() {
    let bloom = manager(DeliveryConfig {
        mute_max_sleep: Duration::from_secs(1),
        ..DeliveryConfig::default()
    });
    let user = UserId(11);
    bloom.add_mute(user, now_millis() + 2_000);
    assert!(bloom.is_muted(user));

    tokio::time::sleep(Duration::from_millis(3_200)).await;
    assert!(!bloom.is_muted(user));
    assert_eq!(bloom.pending_expiries(), 0);
    bloom.stop().await;
}

#[tokio::test]
async fn earlier_mute_wakes_a_sleeping_worker() {
    let bloom = manager(DeliveryConfig {
        mute_idle_sleep: Duration::from_secs(3600),
        mute_max_sleep: Duration::from_secs(3600),
        ..DeliveryConfig::default()
    });
    let long = UserId(1);
    let short = UserId(2);
    bloom.add_mute(long, now_millis() + 60_000);
    tokio::time::sleep(Duration::from_millis(20)).await;
    bloom.add_mute(short, now_millis() + 200);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!bloom.is_muted(short));
    assert!(bloom.is_muted(long));
    bloom.stop().await;
}
