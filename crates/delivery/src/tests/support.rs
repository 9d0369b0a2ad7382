use std::{
    collections::HashMap,
    future::Future,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::extract::ws::Message as WsMessage;
use cache::MemoryCache;
use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    StreamExt,
};
use parking_lot::Mutex;
use shared::domain::{GroupId, GroupMember, Role, UserId};
use tokio::task::JoinHandle;

use crate::{
    client::run_client, config::DeliveryConfig, error::DeliveryError,
    group_cache::MembershipSource, hub::Hub,
};

const WAIT: Duration = Duration::from_secs(3);

/// Membership authority that counts how often it is consulted.
#[derive(Default)]
pub(crate) struct FakeMembership {
    groups: Mutex<HashMap<GroupId, Vec<GroupMember>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeMembership {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn set_group(&self, group: i64, members: Vec<GroupMember>) {
        self.groups.lock().insert(GroupId(group), members);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipSource for FakeMembership {
    async fn group_members(&self, group: GroupId) -> anyhow::Result<Vec<GroupMember>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.groups.lock().get(&group).cloned().unwrap_or_default())
    }
}

pub(crate) fn member(user: i64, role: Role) -> GroupMember {
    GroupMember {
        user_id: UserId(user),
        role,
    }
}

pub(crate) fn test_config() -> DeliveryConfig {
    DeliveryConfig {
        resend_interval: Duration::from_secs(3600),
        write_retry_delay: Duration::from_millis(1),
        shutdown_timeout: Duration::from_secs(2),
        ..DeliveryConfig::default()
    }
}

pub(crate) struct TestHub {
    pub hub: Hub,
    pub cache: Arc<MemoryCache>,
    pub membership: Arc<FakeMembership>,
}

pub(crate) fn start_hub(config: DeliveryConfig) -> TestHub {
    let cache = Arc::new(MemoryCache::new());
    let membership = Arc::new(FakeMembership::default());
    let hub = Hub::start(config, cache.clone(), membership.clone());
    TestHub {
        hub,
        cache,
        membership,
    }
}

/// A client driven through channel-backed socket halves.
pub(crate) struct TestClient {
    pub user: UserId,
    inbound: UnboundedSender<Result<WsMessage, io::Error>>,
    outbound: UnboundedReceiver<WsMessage>,
    pub task: JoinHandle<Result<(), DeliveryError>>,
}

impl TestClient {
    pub(crate) fn send_json(&self, value: serde_json::Value) {
        self.inbound
            .unbounded_send(Ok(WsMessage::Text(value.to_string())))
            .expect("inbound open");
    }

    pub(crate) fn send_text(&self, text: &str) {
        self.inbound
            .unbounded_send(Ok(WsMessage::Text(text.to_string())))
            .expect("inbound open");
    }

    pub(crate) async fn recv(&mut self) -> WsMessage {
        tokio::time::timeout(WAIT, self.outbound.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
    }

    pub(crate) async fn recv_envelope(&mut self) -> serde_json::Value {
        match self.recv().await {
            WsMessage::Text(text) => serde_json::from_str(&text).expect("json frame"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// True when nothing arrives within `quiet`.
    pub(crate) async fn is_quiet(&mut self, quiet: Duration) -> bool {
        tokio::time::timeout(quiet, self.outbound.next())
            .await
            .is_err()
    }
}

pub(crate) async fn connect(hub: &Hub, user: i64) -> TestClient {
    let user = UserId(user);
    let (out_tx, outbound) = unbounded();
    let (inbound, in_rx) = unbounded();
    let task = tokio::spawn(run_client(hub.clone(), user, out_tx, in_rx));
    let online = hub.clone();
    wait_until(move || online.is_online(user)).await;
    TestClient {
        user,
        inbound,
        outbound,
        task,
    }
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
