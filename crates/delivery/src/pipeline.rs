//! Outbound message pipeline.
//!
//! A message passes through an ordered chain of [`Middleware`]s; the first
//! one registered is the outermost. Each may inspect or rewrite the
//! [`MessageContext`], stop the message by returning without calling
//! [`Next::run`], or act after the rest of the chain completed. The chain
//! always ends in [`DirectSend`].

use std::sync::Arc;

use async_trait::async_trait;
use shared::{domain::UserId, protocol::Message};
use tracing::{debug, warn};

use crate::{error::DeliveryError, registry::Registry, store::MessageStore};

/// Per-message state shared by the middlewares.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: Message,
    pub recipients: Vec<UserId>,
    /// Fall back to the offline store for recipients that are not online.
    pub cache: bool,
    /// Track live deliveries in the pending-ack set.
    pub pending: bool,
    /// Set by [`DirectSend`] once delivery ran.
    pub sent: bool,
}

impl MessageContext {
    pub fn new(message: Message, recipients: Vec<UserId>) -> Self {
        let kind = message.kind;
        Self {
            message,
            recipients,
            cache: kind.is_cacheable(),
            pending: kind.is_tracked(),
            sent: false,
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<(), DeliveryError>;
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a DirectSend,
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut MessageContext) -> Result<(), DeliveryError> {
        match self.chain.split_first() {
            Some((current, rest)) => {
                current
                    .process(
                        ctx,
                        Next {
                            chain: rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => {
                self.terminal.deliver(ctx).await;
                Ok(())
            }
        }
    }
}

pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Arc<DirectSend>,
}

impl Pipeline {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, terminal: Arc<DirectSend>) -> Self {
        Self {
            middlewares,
            terminal,
        }
    }

    pub async fn dispatch(&self, ctx: &mut MessageContext) -> Result<(), DeliveryError> {
        Next {
            chain: &self.middlewares,
            terminal: &self.terminal,
        }
        .run(ctx)
        .await
    }
}

/// Terminal stage: hands each recipient its copy on the live connection, or
/// parks it in the offline store.
pub struct DirectSend {
    registry: Arc<Registry>,
    store: Arc<MessageStore>,
}

impl DirectSend {
    pub(crate) fn new(registry: Arc<Registry>, store: Arc<MessageStore>) -> Self {
        Self { registry, store }
    }

    pub async fn deliver(&self, ctx: &mut MessageContext) {
        for &recipient in &ctx.recipients {
            let copy = ctx.message.fanout_copy();
            if self.deliver_live(recipient, copy.clone()) {
                if ctx.pending {
                    if let Err(error) = self.store.track_pending(recipient, &copy) {
                        warn!(%recipient, id = %copy.id, %error, "failed to track pending message");
                    }
                }
            } else if ctx.cache {
                if let Err(error) = self.store.store_offline(recipient, &copy).await {
                    warn!(%recipient, id = %copy.id, %error, "failed to store offline message");
                }
            } else {
                debug!(%recipient, id = %copy.id, kind = ?copy.kind, "recipient offline, message dropped");
            }
        }
        ctx.sent = true;
    }

    /// Enqueues on the recipient's live connection. `false` when the user is
    /// offline, closing, or its queue is full.
    pub fn deliver_live(&self, recipient: UserId, message: Message) -> bool {
        self.registry
            .get(recipient)
            .is_some_and(|conn| conn.try_deliver(message))
    }
}
