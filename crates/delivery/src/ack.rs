use std::sync::Arc;

use async_trait::async_trait;
use shared::domain::SYSTEM_USER;
use tracing::debug;

use crate::{
    error::DeliveryError,
    pipeline::{DirectSend, MessageContext, Middleware, Next},
};

/// Stamps message identity and, once the rest of the chain delivered a
/// user-originated message, confirms it to the sender.
pub struct AckMiddleware {
    direct: Arc<DirectSend>,
}

impl AckMiddleware {
    pub fn new(direct: Arc<DirectSend>) -> Self {
        Self { direct }
    }
}

#[async_trait]
impl Middleware for AckMiddleware {
    async fn process(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<(), DeliveryError> {
        ctx.message.ensure_identity();
        next.run(ctx).await?;

        let message = &ctx.message;
        if ctx.sent && message.kind.requires_ack() && message.from != SYSTEM_USER {
            // Acks are never cached: an offline sender simply misses it.
            if !self.direct.deliver_live(message.from, message.ack()) {
                debug!(sender = %message.from, id = %message.id, "sender offline, ack dropped");
            }
        }
        Ok(())
    }
}
