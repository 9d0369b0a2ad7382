use std::{sync::Arc, time::Duration};

use cache::{BatchConfig, BatchWriter, MemoryCache};
use shared::{
    domain::UserId,
    protocol::{now_millis, Message, MessageType},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DeliveryConfig, pipeline::DirectSend, registry::Registry, resend::ResendLoop,
    store::MessageStore,
};

fn resend_loop(config: &DeliveryConfig) -> (ResendLoop, Arc<MessageStore>) {
    let cache = Arc::new(MemoryCache::new());
    let batch = BatchWriter::start(
        cache.clone(),
        BatchConfig {
            max_batch: 1_000,
            flush_interval: Duration::from_secs(3600),
            ..BatchConfig::default()
        },
    );
    let store = Arc::new(MessageStore::new(cache, batch, config));
    let direct = Arc::new(DirectSend::new(Arc::new(Registry::new()), store.clone()));
    (ResendLoop::new(store.clone(), direct, config), store)
}

async fn seed_stale(store: &MessageStore, recipient: UserId, count: i64) {
    let base = now_millis() - 60_000;
    for n in 0..count {
        let mut message = Message::new(MessageType::Chat, UserId(1), recipient.0, format!("m{n}"));
        message.time = base + n;
        message.ensure_identity();
        store.track_pending(recipient, &message).expect("track");
    }
    store.flush().await.expect("flush");
}

#[tokio::test]
async fn tick_reports_backlog_until_the_set_is_drained() {
    let config = DeliveryConfig {
        resend_batch_size: 3,
        ..DeliveryConfig::default()
    };
    let (resend, store) = resend_loop(&config);
    let recipient = UserId(9);
    seed_stale(&store, recipient, 5).await;

    assert!(resend.tick().await.expect("first pass"));
    assert_eq!(store.pending_len().await.expect("len"), 2);
    assert_eq!(store.offline_messages(recipient).await.expect("offline").len(), 3);

    assert!(!resend.tick().await.expect("second pass"));
    assert_eq!(store.pending_len().await.expect("len"), 0);
    let parked = store.offline_messages(recipient).await.expect("offline");
    assert_eq!(parked.len(), 5);
    assert_eq!(parked[0].message.body, "m0");
}

#[tokio::test]
async fn exact_batch_is_not_a_backlog() {
    let config = DeliveryConfig {
        resend_batch_size: 3,
        ..DeliveryConfig::default()
    };
    let (resend, store) = resend_loop(&config);
    seed_stale(&store, UserId(4), 3).await;

    assert!(!resend.tick().await.expect("pass"));
    assert_eq!(store.pending_len().await.expect("len"), 0);
}

#[tokio::test]
async fn fresh_entries_wait_for_the_ack_timeout() {
    let config = DeliveryConfig::default();
    let (resend, store) = resend_loop(&config);
    let mut message = Message::new(MessageType::Chat, UserId(1), 4, "just sent");
    message.ensure_identity();
    store.track_pending(UserId(4), &message).expect("track");
    store.flush().await.expect("flush");

    assert!(!resend.tick().await.expect("pass"));
    assert_eq!(store.pending_len().await.expect("len"), 1);
    assert!(store.offline_messages(UserId(4)).await.expect("offline").is_empty());
}

#[tokio::test]
async fn backlog_is_worked_off_without_waiting_a_full_interval() {
    let config = DeliveryConfig {
        resend_batch_size: 1,
        resend_interval: Duration::from_millis(200),
        resend_fast_delay: Duration::from_millis(1),
        ..DeliveryConfig::default()
    };
    let (resend, store) = resend_loop(&config);
    seed_stale(&store, UserId(7), 5).await;

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(resend.run(shutdown.clone()));

    // Five passes at the regular interval would take a full second.
    tokio::time::timeout(Duration::from_millis(700), async {
        while store.pending_len().await.expect("len") > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backlog drained on the fast path");

    shutdown.cancel();
    task.await.expect("join");
    assert_eq!(store.offline_messages(UserId(7)).await.expect("offline").len(), 5);
}
