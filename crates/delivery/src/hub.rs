use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use cache::{BatchWriter, CacheService};
use futures::future::join_all;
use parking_lot::Mutex;
use shared::{
    domain::{GroupMember, UserId},
    protocol::{AckBody, Extra, Message, MessageType},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ack::AckMiddleware,
    bloom::BloomFilterManager,
    client::{CloseReason, ConnectionHandle},
    config::DeliveryConfig,
    error::DeliveryError,
    filter::FilterMiddleware,
    group_cache::{GroupCache, MembershipSource},
    pipeline::{DirectSend, MessageContext, Middleware, Pipeline},
    policy::PolicyStore,
    registry::Registry,
    resend::ResendLoop,
    store::MessageStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Running,
    Stopping,
    Stopped,
}

impl HubState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => HubState::Running,
            1 => HubState::Stopping,
            _ => HubState::Stopped,
        }
    }
}

/// Entry point of the delivery core. Cheap to clone.
///
/// Registry changes and message dispatch are serialized through one event
/// loop fed by bounded intake queues; callers only enqueue.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: DeliveryConfig,
    state: AtomicU8,
    started_at: Instant,
    registry: Arc<Registry>,
    pipeline: Pipeline,
    store: Arc<MessageStore>,
    policy: Arc<PolicyStore>,
    bloom: Arc<BloomFilterManager>,
    groups: Arc<GroupCache>,
    register_tx: mpsc::Sender<ConnectionHandle>,
    unregister_tx: mpsc::Sender<ConnectionHandle>,
    chat_tx: mpsc::Sender<Message>,
    broadcast_tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Intake {
    register: mpsc::Receiver<ConnectionHandle>,
    unregister: mpsc::Receiver<ConnectionHandle>,
    chat: mpsc::Receiver<Message>,
    broadcast: mpsc::Receiver<Message>,
}

impl Hub {
    /// Builds the delivery core on top of `cache` and spawns its background
    /// tasks: the event loop, the resend loop, the mute-expiry worker and the
    /// batch flusher.
    pub fn start(
        config: DeliveryConfig,
        cache: Arc<dyn CacheService>,
        membership: Arc<dyn MembershipSource>,
    ) -> Self {
        let batch = BatchWriter::start(cache.clone(), config.batch.clone());
        let store = Arc::new(MessageStore::new(cache.clone(), batch, &config));
        let bloom = Arc::new(BloomFilterManager::new(&config));
        bloom.start();
        let policy = Arc::new(PolicyStore::new(cache.clone(), bloom.clone()));
        let groups = Arc::new(GroupCache::new(cache, membership, &config));
        let registry = Arc::new(Registry::new());
        let direct = Arc::new(DirectSend::new(registry.clone(), store.clone()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(FilterMiddleware::new(policy.clone())) as Arc<dyn Middleware>,
            Arc::new(AckMiddleware::new(direct.clone())) as Arc<dyn Middleware>,
        ];
        let pipeline = Pipeline::new(middlewares, direct.clone());

        let capacity = config.intake_capacity.max(1);
        let (register_tx, register) = mpsc::channel(capacity);
        let (unregister_tx, unregister) = mpsc::channel(capacity);
        let (chat_tx, chat) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast) = mpsc::channel(capacity);
        let resend = ResendLoop::new(store.clone(), direct, &config);

        let inner = Arc::new(HubInner {
            config,
            state: AtomicU8::new(HubState::Running as u8),
            started_at: Instant::now(),
            registry,
            pipeline,
            store,
            policy,
            bloom,
            groups,
            register_tx,
            unregister_tx,
            chat_tx,
            broadcast_tx,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let event_loop = tokio::spawn(inner.clone().run(Intake {
            register,
            unregister,
            chat,
            broadcast,
        }));
        let resend_loop = tokio::spawn(resend.run(inner.shutdown.clone()));
        inner.tasks.lock().extend([event_loop, resend_loop]);
        info!("hub started");
        Self { inner }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.inner.policy
    }

    pub fn groups(&self) -> &Arc<GroupCache> {
        &self.inner.groups
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.inner.store
    }

    pub fn state(&self) -> HubState {
        HubState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() != HubState::Running
    }

    pub fn count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.inner.registry.get(user).is_some()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    fn ensure_running(&self) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::ServerClosed);
        }
        Ok(())
    }

    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), DeliveryError> {
        self.ensure_running()?;
        self.inner
            .register_tx
            .send(conn)
            .await
            .map_err(|_| DeliveryError::ServerClosed)
    }

    /// Never fails: once the loop is gone there is nothing left to remove from.
    pub async fn unregister(&self, conn: ConnectionHandle) {
        if self.inner.unregister_tx.send(conn).await.is_err() {
            debug!("hub loop gone, unregister skipped");
        }
    }

    /// Queues a single-recipient message (Chat, System, UpdateBlockList).
    pub async fn send_to_chat(&self, message: Message) -> Result<(), DeliveryError> {
        self.ensure_running()?;
        self.inner
            .chat_tx
            .send(message)
            .await
            .map_err(|_| DeliveryError::ServerClosed)
    }

    /// Queues a group fan-out. `message.to` names the group unless
    /// `Extra::Recipients` lists the recipients explicitly.
    pub async fn send_to_broadcast(&self, message: Message) -> Result<(), DeliveryError> {
        self.ensure_running()?;
        self.inner
            .broadcast_tx
            .send(message)
            .await
            .map_err(|_| DeliveryError::ServerClosed)
    }

    /// Handles a recipient's Ack: the pending entry keyed by
    /// `(ack.id, acker, ack.time)` is dropped.
    pub async fn send_to_ack(&self, acker: UserId, ack: &AckBody) -> Result<bool, DeliveryError> {
        let removed = self
            .inner
            .store
            .remove_pending(&ack.id, acker, ack.time as f64)
            .await?;
        if !removed {
            debug!(%acker, id = %ack.id, "ack for unknown pending entry");
        }
        Ok(removed)
    }

    /// Tells `to` that `from` changed its block list entry for them.
    pub async fn send_update_blocked_list_notify(
        &self,
        from: UserId,
        to: UserId,
        blocked: bool,
    ) -> Result<(), DeliveryError> {
        let message = Message::new(MessageType::UpdateBlockList, from, to.0, "")
            .with_extra(Extra::Blocked(blocked));
        self.send_to_chat(message).await
    }

    /// Forwards a join request to the admins of the group in `message.to`.
    pub async fn send_to_apply(&self, mut message: Message) -> Result<(), DeliveryError> {
        message.kind = MessageType::Apply;
        self.send_to_broadcast(message).await
    }

    pub async fn store_offline_message(
        &self,
        user: UserId,
        message: &Message,
    ) -> Result<(), DeliveryError> {
        self.inner.store.store_offline(user, message).await
    }

    /// Removes `user` from the registry immediately and closes the connection.
    pub async fn kick(&self, user: UserId) -> Result<(), DeliveryError> {
        let conn = self
            .inner
            .registry
            .remove(user)
            .ok_or(DeliveryError::ConnectionNotFound(user))?;
        info!(%user, conn_id = conn.conn_id(), "kicking connection");
        conn.close(CloseReason::Kicked).await;
        Ok(())
    }

    /// Closes every connection, waits for them to drain and stops the
    /// background tasks. Later calls return immediately.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(
                HubState::Running as u8,
                HubState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let live = inner.registry.snapshot();
        info!(connections = live.len(), "stopping hub");
        let closing = join_all(live.iter().map(|conn| conn.close(CloseReason::ServerClosed)));
        if tokio::time::timeout(inner.config.shutdown_timeout, closing)
            .await
            .is_err()
        {
            warn!("timed out signalling connections to close");
        }
        if !inner.registry.wait_empty(inner.config.shutdown_timeout).await {
            let stranded = inner.registry.drain_all();
            warn!(remaining = stranded.len(), "connections did not drain in time, clearing registry");
            for conn in stranded {
                conn.finish();
            }
        }

        inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                error!(%error, "hub task ended abnormally");
            }
        }
        inner.bloom.stop().await;
        inner.store.shutdown().await;
        inner.state.store(HubState::Stopped as u8, Ordering::Release);
        info!("hub stopped");
    }
}

impl HubInner {
    async fn run(self: Arc<Self>, mut intake: Intake) {
        debug!("hub event loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(conn) = intake.register.recv() => self.on_register(conn),
                Some(conn) = intake.unregister.recv() => self.on_unregister(conn),
                Some(message) = intake.chat.recv() => self.on_chat(message).await,
                Some(message) = intake.broadcast.recv() => self.on_broadcast(message).await,
                else => break,
            }
        }
        debug!("hub event loop stopped");
    }

    fn on_register(&self, conn: ConnectionHandle) {
        if self.state.load(Ordering::Acquire) != HubState::Running as u8 {
            tokio::spawn(async move { conn.close(CloseReason::ServerClosed).await });
            return;
        }

        let user = conn.user();
        if let Some(previous) = self.registry.insert(conn.clone()) {
            if previous.conn_id() != conn.conn_id() {
                info!(%user, old = previous.conn_id(), new = conn.conn_id(), "replacing existing connection");
                tokio::spawn(async move { previous.close(CloseReason::Replaced).await });
            }
        }
        debug!(%user, online = self.registry.len(), "connection registered");
        tokio::spawn(drain_offline(self.store.clone(), conn));
    }

    fn on_unregister(&self, conn: ConnectionHandle) {
        if self.registry.remove_if_current(&conn) {
            debug!(user = %conn.user(), online = self.registry.len(), "connection unregistered");
        }
    }

    async fn on_chat(&self, message: Message) {
        let recipients = vec![message.recipient()];
        self.dispatch(MessageContext::new(message, recipients)).await;
    }

    async fn on_broadcast(&self, message: Message) {
        let recipients = match self.fanout_recipients(&message).await {
            Ok(recipients) => recipients,
            Err(error) => {
                warn!(group = message.to, id = %message.id, %error, "could not resolve broadcast recipients");
                return;
            }
        };
        self.dispatch(MessageContext::new(message, recipients)).await;
    }

    /// Explicit recipients win; otherwise the group's members (admins for a
    /// join request), excluding the sender.
    async fn fanout_recipients(&self, message: &Message) -> Result<Vec<UserId>, DeliveryError> {
        if let Extra::Recipients(list) = &message.extra {
            return Ok(list.clone());
        }
        let group = message.target_group();
        let members: Vec<GroupMember> = match message.kind {
            MessageType::Apply => self.groups.admins(group).await?,
            _ => self.groups.members(group).await?,
        };
        Ok(members
            .into_iter()
            .map(|member| member.user_id)
            .filter(|user| *user != message.from)
            .collect())
    }

    async fn dispatch(&self, mut ctx: MessageContext) {
        if let Err(error) = self.pipeline.dispatch(&mut ctx).await {
            warn!(id = %ctx.message.id, kind = ?ctx.message.kind, %error, "message pipeline failed");
        }
    }
}

/// Replays a freshly registered user's offline messages onto its queue.
async fn drain_offline(store: Arc<MessageStore>, conn: ConnectionHandle) {
    let user = conn.user();
    let entries = match store.offline_messages(user).await {
        Ok(entries) => entries,
        Err(error) => {
            warn!(%user, %error, "failed to load offline messages");
            return;
        }
    };
    let total = entries.len();
    let mut delivered = 0;
    for entry in entries {
        if !conn.try_deliver(entry.message.clone()) {
            break;
        }
        delivered += 1;
        if let Err(error) = store.remove_offline(user, &entry).await {
            warn!(%user, id = %entry.message.id, %error, "failed to remove offline message");
        }
        if entry.message.kind.is_tracked() {
            if let Err(error) = store.track_pending(user, &entry.message) {
                warn!(%user, id = %entry.message.id, %error, "failed to track replayed message");
            }
        }
    }
    if total > 0 {
        debug!(%user, delivered, total, "offline messages replayed");
    }
}
