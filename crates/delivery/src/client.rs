//! One WebSocket connection: a reader task feeding the hub and a writer task
//! draining the connection's private send queue.

use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientFrame, Extra, Message},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::DeliveryError, hub::Hub};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ServerClosed,
    Kicked,
    Replaced,
    ClientGone,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::ServerClosed => 1001,
            CloseReason::Kicked => 1008,
            CloseReason::Replaced => 4000,
            CloseReason::ClientGone => 1000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ServerClosed => "server closed",
            CloseReason::Kicked => "kicked",
            CloseReason::Replaced => "replaced by a new connection",
            CloseReason::ClientGone => "client disconnected",
        }
    }
}

pub(crate) enum Outbound {
    Message(Message),
    Close(CloseReason),
}

pub type ConnectionHandle = Arc<Connection>;

/// Registry-facing half of a client connection.
pub struct Connection {
    user: UserId,
    conn_id: u64,
    tx: mpsc::Sender<Outbound>,
    closing: AtomicBool,
    finished: CancellationToken,
}

impl Connection {
    pub(crate) fn new(user: UserId, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            user,
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            closing: AtomicBool::new(false),
            finished: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Non-blocking enqueue. `false` when the connection is closing or its
    /// queue is full; the caller decides where the message goes instead.
    pub fn try_deliver(&self, message: Message) -> bool {
        if self.is_closing() {
            return false;
        }
        self.tx.try_send(Outbound::Message(message)).is_ok()
    }

    /// Asks the writer to send a close frame and wind down. Only the first
    /// call has an effect.
    pub async fn close(&self, reason: CloseReason) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(user = %self.user, conn_id = self.conn_id, reason = reason.as_str(), "closing connection");
        // An error means the writer is already gone.
        let _ = self.tx.send(Outbound::Close(reason)).await;
    }

    /// Marks the connection fully torn down and stops its reader.
    pub(crate) fn finish(&self) {
        self.closing.store(true, Ordering::Release);
        self.finished.cancel();
    }

    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }
}

/// Serves an upgraded axum WebSocket until either side closes it.
pub async fn serve_socket(hub: Hub, user: UserId, socket: WebSocket) -> Result<(), DeliveryError> {
    let (sink, stream) = socket.split();
    run_client(hub, user, sink, stream).await
}

/// Registers a connection for `user` and pumps frames between the socket
/// halves and the hub. Returns once the connection is torn down.
pub async fn run_client<S, St, E>(
    hub: Hub,
    user: UserId,
    sink: S,
    stream: St,
) -> Result<(), DeliveryError>
where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    S::Error: Display + Send,
    St: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
    E: Display + Send,
{
    let (conn, rx) = Connection::new(user, hub.config().send_queue_capacity);
    hub.register(conn.clone()).await?;
    info!(%user, conn_id = conn.conn_id(), "client connected");

    let writer = tokio::spawn(write_loop(hub.clone(), conn.clone(), rx, sink));
    read_loop(&hub, &conn, stream).await;
    conn.close(CloseReason::ClientGone).await;
    let _ = writer.await;
    info!(%user, conn_id = conn.conn_id(), "client disconnected");
    Ok(())
}

async fn read_loop<St, E>(hub: &Hub, conn: &ConnectionHandle, mut stream: St)
where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = conn.finished() => break,
            frame = stream.next() => frame,
        };
        let payload = match frame {
            None => break,
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(bytes))) => bytes,
            Some(Ok(WsMessage::Close(_))) => break,
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                debug!(user = %conn.user(), %error, "socket read failed");
                break;
            }
        };
        if let Err(error) = handle_frame(hub, conn, &payload).await {
            match error {
                DeliveryError::ServerClosed => debug!(user = %conn.user(), "hub closed, dropping reader"),
                error => warn!(user = %conn.user(), %error, "closing connection after bad frame"),
            }
            break;
        }
    }
}

async fn handle_frame(hub: &Hub, conn: &ConnectionHandle, payload: &[u8]) -> Result<(), DeliveryError> {
    match ClientFrame::decode(payload)? {
        ClientFrame::Chat(mut message) => {
            stamp_sender(&mut message, conn.user());
            hub.send_to_chat(message).await
        }
        ClientFrame::Broadcast(mut message) => {
            stamp_sender(&mut message, conn.user());
            hub.send_to_broadcast(message).await
        }
        ClientFrame::Ack(ack) => {
            hub.send_to_ack(conn.user(), &ack).await?;
            Ok(())
        }
    }
}

/// Client frames carry no routing overrides: the sender is the socket's user
/// and fan-out always resolves through group membership.
fn stamp_sender(message: &mut Message, user: UserId) {
    message.from = user;
    message.extra = Extra::None;
}

async fn write_loop<S>(hub: Hub, conn: ConnectionHandle, mut rx: mpsc::Receiver<Outbound>, mut sink: S)
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let attempts = hub.config().write_retries.max(1);
    let delay = hub.config().write_retry_delay;

    // A forced finish ends the loop even while a write is stuck on the socket.
    loop {
        let outbound = tokio::select! {
            biased;
            _ = conn.finished() => break,
            outbound = rx.recv() => outbound,
        };
        match outbound {
            None => break,
            Some(Outbound::Message(message)) => {
                let written = tokio::select! {
                    written = write_message(&mut sink, &message, attempts, delay) => written,
                    _ = conn.finished() => {
                        park_offline(&hub, conn.user(), &message).await;
                        break;
                    }
                };
                if let Err(error) = written {
                    warn!(user = %conn.user(), id = %message.id, %error, "write failed, parking message offline");
                    park_offline(&hub, conn.user(), &message).await;
                }
            }
            Some(Outbound::Close(reason)) => {
                let frame = CloseFrame {
                    code: reason.code(),
                    reason: reason.as_str().into(),
                };
                tokio::select! {
                    sent = sink.send(WsMessage::Close(Some(frame))) => {
                        if let Err(error) = sent {
                            debug!(user = %conn.user(), %error, "close frame not delivered");
                        }
                    }
                    _ = conn.finished() => {}
                }
                break;
            }
        }
    }

    // Anything still queued was never written.
    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        if let Outbound::Message(message) = outbound {
            park_offline(&hub, conn.user(), &message).await;
        }
    }
    tokio::select! {
        _ = sink.close() => {}
        _ = conn.finished() => {}
    }
    conn.finish();
    hub.unregister(conn).await;
}

async fn write_message<S>(
    sink: &mut S,
    message: &Message,
    attempts: usize,
    delay: Duration,
) -> Result<(), DeliveryError>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let text = message.encode()?;
    let mut attempt = 1;
    loop {
        let error = match sink.send(WsMessage::Text(text.clone())).await {
            Ok(()) => return Ok(()),
            Err(error) => error.to_string(),
        };
        if attempt >= attempts {
            return Err(DeliveryError::Write(error));
        }
        debug!(id = %message.id, attempt, %error, "socket write failed, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn park_offline(hub: &Hub, user: UserId, message: &Message) {
    if !message.kind.is_cacheable() {
        return;
    }
    if let Err(error) = hub.store_offline_message(user, message).await {
        warn!(%user, id = %message.id, %error, "failed to park undelivered message");
    }
}
