use delivery::{DeliveryError, Hub, NotifyOutcome};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{GroupId, GroupMember, Role, UserId, SYSTEM_USER},
    error::{ApiError, ErrorCode},
    protocol::{now_millis, Extra, Message, MessageType},
};
use storage::Storage;
use tracing::info;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub hub: Hub,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BanRequest {
    pub user_id: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BanResponse {
    pub user_id: i64,
    /// `false` when the user was already banned.
    pub banned: bool,
    pub kicked: bool,
    pub notification: NotifyOutcome,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UnbanResponse {
    pub user_id: i64,
    pub unbanned: bool,
    pub notification: NotifyOutcome,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MuteRequest {
    pub user_id: i64,
    pub duration_secs: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MuteResponse {
    pub user_id: i64,
    /// Unix millis.
    pub expire_at: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UnmuteResponse {
    pub user_id: i64,
    pub unmuted: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct KickResponse {
    pub user_id: i64,
    pub kicked: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddMemberRequest {
    pub user_id: i64,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::Member
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MembershipResponse {
    pub group_id: i64,
    pub user_id: i64,
    /// `true` when the membership changed.
    pub changed: bool,
    pub notification: NotifyOutcome,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatsResponse {
    pub online: usize,
    pub uptime_secs: u64,
    pub closed: bool,
    pub pending: usize,
}

/// Body of the System notification sent on membership changes.
pub const JOINED_BODY: &str = "joined";
pub const LEFT_BODY: &str = "left";

pub async fn stats(ctx: &ApiContext) -> Result<StatsResponse, ApiError> {
    let pending = ctx.hub.store().pending_len().await.map_err(delivery)?;
    Ok(StatsResponse {
        online: ctx.hub.count(),
        uptime_secs: ctx.hub.uptime().as_secs(),
        closed: ctx.hub.is_closed(),
        pending,
    })
}

/// Gate for the WebSocket upgrade.
pub async fn check_connect(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    ensure_user(user_id)?;
    if ctx.hub.is_closed() {
        return Err(ApiError::new(ErrorCode::Unavailable, "server closed"));
    }
    if ctx.hub.policy().is_banned(user_id).await.map_err(delivery)? {
        return Err(ApiError::new(ErrorCode::Forbidden, "user is banned"));
    }
    Ok(())
}

/// Records the ban, tells the user and drops their live connection.
pub async fn ban_user(ctx: &ApiContext, user_id: UserId) -> Result<BanResponse, ApiError> {
    ensure_user(user_id)?;
    let banned = ctx.storage.ban_user(user_id).await.map_err(internal)?;
    ctx.hub.policy().ban(user_id).await.map_err(delivery)?;

    let sent = ctx
        .hub
        .send_update_blocked_list_notify(SYSTEM_USER, user_id, true)
        .await;
    let kicked = ctx.hub.kick(user_id).await.is_ok();
    info!(%user_id, banned, kicked, "ban applied");
    Ok(BanResponse {
        user_id: user_id.0,
        banned,
        kicked,
        notification: NotifyOutcome::from_result(&sent),
    })
}

pub async fn unban_user(ctx: &ApiContext, user_id: UserId) -> Result<UnbanResponse, ApiError> {
    ensure_user(user_id)?;
    let unbanned = ctx.storage.unban_user(user_id).await.map_err(internal)?;
    if !unbanned {
        return Err(ApiError::new(ErrorCode::NotFound, "user is not banned"));
    }
    ctx.hub.policy().unban(user_id).await.map_err(delivery)?;

    let sent = ctx
        .hub
        .send_update_blocked_list_notify(SYSTEM_USER, user_id, false)
        .await;
    Ok(UnbanResponse {
        user_id: user_id.0,
        unbanned,
        notification: NotifyOutcome::from_result(&sent),
    })
}

pub async fn mute_user(
    ctx: &ApiContext,
    user_id: UserId,
    duration_secs: u64,
) -> Result<MuteResponse, ApiError> {
    ensure_user(user_id)?;
    if duration_secs == 0 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "duration_secs must be positive",
        ));
    }
    let millis = i64::try_from(duration_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let expire_at = now_millis().saturating_add(millis);
    ctx.storage
        .mute_user(user_id, expire_at)
        .await
        .map_err(internal)?;
    ctx.hub
        .policy()
        .mute(user_id, expire_at)
        .await
        .map_err(delivery)?;
    Ok(MuteResponse {
        user_id: user_id.0,
        expire_at,
    })
}

pub async fn unmute_user(ctx: &ApiContext, user_id: UserId) -> Result<UnmuteResponse, ApiError> {
    ensure_user(user_id)?;
    let stored = ctx.storage.unmute_user(user_id).await.map_err(internal)?;
    let cached = ctx.hub.policy().unmute(user_id).await.map_err(delivery)?;
    Ok(UnmuteResponse {
        user_id: user_id.0,
        unmuted: stored || cached,
    })
}

pub async fn kick_user(ctx: &ApiContext, user_id: UserId) -> Result<KickResponse, ApiError> {
    ensure_user(user_id)?;
    match ctx.hub.kick(user_id).await {
        Ok(()) => Ok(KickResponse {
            user_id: user_id.0,
            kicked: true,
        }),
        Err(DeliveryError::ConnectionNotFound(_)) => {
            Err(ApiError::new(ErrorCode::NotFound, "user is not online"))
        }
        Err(err) => Err(delivery(err)),
    }
}

pub async fn add_group_member(
    ctx: &ApiContext,
    group_id: GroupId,
    user_id: UserId,
    role: Role,
) -> Result<MembershipResponse, ApiError> {
    ensure_user(user_id)?;
    let changed = ctx
        .storage
        .add_group_member(group_id, user_id, role)
        .await
        .map_err(internal)?;
    ctx.hub
        .groups()
        .member_joined(group_id, GroupMember { user_id, role })
        .await
        .map_err(delivery)?;

    let sent = notify_membership(ctx, group_id, user_id, JOINED_BODY).await;
    Ok(MembershipResponse {
        group_id: group_id.0,
        user_id: user_id.0,
        changed,
        notification: NotifyOutcome::from_result(&sent),
    })
}

pub async fn remove_group_member(
    ctx: &ApiContext,
    group_id: GroupId,
    user_id: UserId,
) -> Result<MembershipResponse, ApiError> {
    ensure_user(user_id)?;
    let changed = ctx
        .storage
        .remove_group_member(group_id, user_id)
        .await
        .map_err(internal)?;
    if !changed {
        return Err(ApiError::new(ErrorCode::NotFound, "user is not a member"));
    }
    ctx.hub
        .groups()
        .member_left(group_id, user_id)
        .await
        .map_err(delivery)?;

    let sent = notify_membership(ctx, group_id, user_id, LEFT_BODY).await;
    Ok(MembershipResponse {
        group_id: group_id.0,
        user_id: user_id.0,
        changed,
        notification: NotifyOutcome::from_result(&sent),
    })
}

async fn notify_membership(
    ctx: &ApiContext,
    group_id: GroupId,
    user_id: UserId,
    body: &str,
) -> Result<(), DeliveryError> {
    let message = Message::new(MessageType::System, SYSTEM_USER, user_id.0, body)
        .with_extra(Extra::Group(group_id));
    ctx.hub.send_to_chat(message).await
}

fn ensure_user(user_id: UserId) -> Result<(), ApiError> {
    if user_id.0 <= SYSTEM_USER.0 {
        return Err(ApiError::new(ErrorCode::Validation, "invalid user id"));
    }
    Ok(())
}

fn delivery(err: DeliveryError) -> ApiError {
    if err.is_unavailable() {
        ApiError::new(ErrorCode::Unavailable, err.to_string())
    } else {
        ApiError::new(ErrorCode::Internal, err.to_string())
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
