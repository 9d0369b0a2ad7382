use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    error::DeliveryError,
    pipeline::{MessageContext, Middleware, Next},
    policy::PolicyStore,
};

/// Drops messages from muted senders and strips banned recipients.
///
/// Only user-originated kinds are filtered; server notifications pass
/// through. A policy lookup that fails lets the message through.
pub struct FilterMiddleware {
    policy: Arc<PolicyStore>,
}

impl FilterMiddleware {
    pub fn new(policy: Arc<PolicyStore>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for FilterMiddleware {
    async fn process(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<(), DeliveryError> {
        if !ctx.message.kind.requires_ack() {
            return next.run(ctx).await;
        }

        let sender = ctx.message.from;
        match self.policy.is_muted(sender).await {
            Ok(true) => {
                debug!(%sender, id = %ctx.message.id, "sender is muted, message dropped");
                return Ok(());
            }
            Ok(false) => {}
            Err(error) => warn!(%sender, %error, "mute lookup failed"),
        }

        // Allowed recipients are compacted to the front.
        let mut allowed = 0;
        for index in 0..ctx.recipients.len() {
            let recipient = ctx.recipients[index];
            let banned = match self.policy.is_banned(recipient).await {
                Ok(banned) => banned,
                Err(error) => {
                    warn!(%recipient, %error, "ban lookup failed");
                    false
                }
            };
            if !banned {
                ctx.recipients.swap(allowed, index);
                allowed += 1;
            }
        }
        if allowed < ctx.recipients.len() {
            debug!(
                id = %ctx.message.id,
                banned = ctx.recipients.len() - allowed,
                "skipping banned recipients"
            );
        }
        ctx.recipients.truncate(allowed);

        next.run(ctx).await
    }
}
