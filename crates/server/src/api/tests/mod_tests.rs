use super::*;
use cache::MemoryCache;
use delivery::DeliveryConfig;
use std::{sync::Arc, time::Duration};

async fn setup() -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let config = DeliveryConfig {
        shutdown_timeout: Duration::from_secs(2),
        ..DeliveryConfig::default()
    };
    let hub = Hub::start(
        config,
        Arc::new(MemoryCache::new()),
        Arc::new(storage.clone()),
    );
    ApiContext { storage, hub }
}

async fn offline_count(ctx: &ApiContext, user: UserId) -> usize {
    for _ in 0..100 {
        let entries = ctx
            .hub
            .store()
            .offline_messages(user)
            .await
            .expect("offline");
        if !entries.is_empty() {
            return entries.len();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    0
}

#[tokio::test]
async fn ban_persists_filters_and_notifies_offline_user() {
    let ctx = setup().await;
    let user = UserId(7);

    let response = ban_user(&ctx, user).await.expect("ban");
    assert!(response.banned);
    assert!(!response.kicked);
    assert_eq!(response.notification, NotifyOutcome::Delivered);

    assert!(ctx.hub.policy().is_banned(user).await.expect("policy"));
    let bans = ctx.storage.list_bans().await.expect("bans");
    assert_eq!(bans.len(), 1);
    assert_eq!(bans[0].user_id, user);
    assert_eq!(offline_count(&ctx, user).await, 1);
}

#[tokio::test]
async fn repeated_ban_is_undone_by_one_unban() {
    let ctx = setup().await;
    let user = UserId(8);

    assert!(ban_user(&ctx, user).await.expect("ban").banned);
    assert!(!ban_user(&ctx, user).await.expect("ban again").banned);

    let response = unban_user(&ctx, user).await.expect("unban");
    assert!(response.unbanned);
    assert!(!ctx.hub.policy().is_banned(user).await.expect("policy"));

    let err = unban_user(&ctx, user).await.expect_err("not banned");
    assert!(matches!(err.code, ErrorCode::NotFound));
}

#[tokio::test]
async fn mute_requires_a_duration_and_can_be_lifted() {
    let ctx = setup().await;
    let user = UserId(9);

    let err = mute_user(&ctx, user, 0).await.expect_err("zero duration");
    assert!(matches!(err.code, ErrorCode::Validation));

    let response = mute_user(&ctx, user, 60).await.expect("mute");
    assert!(response.expire_at > now_millis());
    assert!(ctx.hub.policy().is_muted(user).await.expect("policy"));
    let stored = ctx
        .storage
        .list_active_mutes(now_millis())
        .await
        .expect("mutes");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].expire_at, response.expire_at);

    assert!(unmute_user(&ctx, user).await.expect("unmute").unmuted);
    assert!(!ctx.hub.policy().is_muted(user).await.expect("policy"));
}

#[tokio::test]
async fn system_user_is_rejected() {
    let ctx = setup().await;
    let err = ban_user(&ctx, SYSTEM_USER).await.expect_err("system user");
    assert!(matches!(err.code, ErrorCode::Validation));
    let err = check_connect(&ctx, UserId(-3)).await.expect_err("negative id");
    assert!(matches!(err.code, ErrorCode::Validation));
}

#[tokio::test]
async fn kick_of_offline_user_is_not_found() {
    let ctx = setup().await;
    let err = kick_user(&ctx, UserId(5)).await.expect_err("offline");
    assert!(matches!(err.code, ErrorCode::NotFound));
}

#[tokio::test]
async fn membership_changes_reach_the_cache_and_notify() {
    let ctx = setup().await;
    let group = GroupId(3);
    let owner = UserId(1);
    let joiner = UserId(2);

    ctx.storage
        .add_group_member(group, owner, Role::Owner)
        .await
        .expect("owner");
    // Fill the cache so the join has to patch it.
    assert_eq!(ctx.hub.groups().members(group).await.expect("members").len(), 1);

    let response = add_group_member(&ctx, group, joiner, Role::Member)
        .await
        .expect("add");
    assert!(response.changed);
    assert_eq!(response.notification, NotifyOutcome::Delivered);
    let members = ctx.hub.groups().members(group).await.expect("members");
    assert!(members.iter().any(|m| m.user_id == joiner));

    let again = add_group_member(&ctx, group, joiner, Role::Admin)
        .await
        .expect("role change");
    assert!(!again.changed);

    let removed = remove_group_member(&ctx, group, joiner).await.expect("remove");
    assert!(removed.changed);
    let members = ctx.hub.groups().members(group).await.expect("members");
    assert!(members.iter().all(|m| m.user_id != joiner));

    let err = remove_group_member(&ctx, group, joiner)
        .await
        .expect_err("not a member");
    assert!(matches!(err.code, ErrorCode::NotFound));
}

#[tokio::test]
async fn notification_is_delayed_once_the_hub_is_stopped() {
    let ctx = setup().await;
    ctx.hub.stop().await;

    let response = add_group_member(&ctx, GroupId(4), UserId(2), Role::Member)
        .await
        .expect("membership still recorded");
    assert!(response.changed);
    assert_eq!(response.notification, NotifyOutcome::Delayed);

    let err = check_connect(&ctx, UserId(2)).await.expect_err("closed");
    assert!(matches!(err.code, ErrorCode::Unavailable));
}

#[tokio::test]
async fn banned_user_cannot_connect() {
    let ctx = setup().await;
    check_connect(&ctx, UserId(11)).await.expect("allowed");
    ban_user(&ctx, UserId(11)).await.expect("ban");
    let err = check_connect(&ctx, UserId(11)).await.expect_err("banned");
    assert!(matches!(err.code, ErrorCode::Forbidden));
}

#[tokio::test]
async fn stats_report_hub_state() {
    let ctx = setup().await;
    let before = stats(&ctx).await.expect("stats");
    assert_eq!(before.online, 0);
    assert_eq!(before.pending, 0);
    assert!(!before.closed);

    ctx.hub.stop().await;
    assert!(stats(&ctx).await.expect("stats").closed);
}
