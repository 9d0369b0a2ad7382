use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use cache::{CacheService, MemoryCache};
use delivery::{serve_socket, Hub};
use serde::Deserialize;
use shared::{
    domain::{GroupId, UserId},
    error::{ApiError, ErrorCode},
    protocol::now_millis,
};
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use api::{
    AddMemberRequest, ApiContext, BanRequest, BanResponse, KickResponse, MembershipResponse,
    MuteRequest, MuteResponse, StatsResponse, UnbanResponse, UnmuteResponse,
};
use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let cache = connect_cache(&settings).await?;
    let hub = Hub::start(
        settings.delivery_config(),
        cache,
        Arc::new(storage.clone()),
    );
    load_policy(&storage, &hub).await?;

    let state = AppState {
        api: ApiContext {
            storage,
            hub: hub.clone(),
        },
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;
    info!("server stopped");
    Ok(())
}

async fn connect_cache(settings: &Settings) -> anyhow::Result<Arc<dyn CacheService>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &settings.redis_url {
        let cache = cache::RedisCache::connect(url).await?;
        return Ok(Arc::new(cache));
    }

    if settings.redis_url.is_some() {
        warn!("redis_url is set but the redis feature is disabled; using the in-memory cache");
    }
    Ok(Arc::new(MemoryCache::new()))
}

/// Rebuilds the ban/mute filters from the cache, then fills in durable
/// records the cache lost.
async fn load_policy(storage: &Storage, hub: &Hub) -> anyhow::Result<()> {
    let policy = hub.policy();
    policy.warm_up().await?;

    let bans: Vec<UserId> = storage
        .list_bans()
        .await?
        .into_iter()
        .map(|ban| ban.user_id)
        .collect();
    let mutes: Vec<(UserId, i64)> = storage
        .list_active_mutes(now_millis())
        .await?
        .into_iter()
        .map(|mute| (mute.user_id, mute.expire_at))
        .collect();
    policy.seed(&bans, &mutes).await?;
    info!(bans = bans.len(), mutes = mutes.len(), "policy records loaded");
    Ok(())
}

async fn shutdown_signal(hub: Hub) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
    hub.stop().await;
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(http_stats))
        .route("/ws", get(ws_handler))
        .route("/admin/bans", post(http_ban))
        .route("/admin/bans/:user_id", delete(http_unban))
        .route("/admin/mutes", post(http_mute))
        .route("/admin/mutes/:user_id", delete(http_unmute))
        .route("/admin/kick/:user_id", post(http_kick))
        .route("/groups/:group_id/members", post(http_add_member))
        .route(
            "/groups/:group_id/members/:user_id",
            delete(http_remove_member),
        )
        .with_state(state)
}

fn status_for(code: &ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(&err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Unavailable, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_stats(State(state): State<Arc<AppState>>) -> ApiResult<StatsResponse> {
    api::stats(&state.api).await.map(Json).map_err(reject)
}

async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    let user_id = UserId(q.user_id);
    if let Err(err) = api::check_connect(&state.api, user_id).await {
        return reject(err).into_response();
    }
    let Some(ws) = ws else {
        return reject(ApiError::new(
            ErrorCode::Validation,
            "websocket upgrade required",
        ))
        .into_response();
    };

    let hub = state.api.hub.clone();
    ws.on_upgrade(move |socket| async move {
        if let Err(error) = serve_socket(hub, user_id, socket).await {
            warn!(%user_id, %error, "websocket session rejected");
        }
    })
}

async fn http_ban(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BanRequest>,
) -> ApiResult<BanResponse> {
    api::ban_user(&state.api, UserId(req.user_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_unban(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> ApiResult<UnbanResponse> {
    api::unban_user(&state.api, UserId(user_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_mute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MuteRequest>,
) -> ApiResult<MuteResponse> {
    api::mute_user(&state.api, UserId(req.user_id), req.duration_secs)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_unmute(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> ApiResult<UnmuteResponse> {
    api::unmute_user(&state.api, UserId(user_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_kick(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> ApiResult<KickResponse> {
    api::kick_user(&state.api, UserId(user_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_add_member(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<MembershipResponse> {
    api::add_group_member(&state.api, GroupId(group_id), UserId(req.user_id), req.role)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_remove_member(
    State(state): State<Arc<AppState>>,
    Path((group_id, user_id)): Path<(i64, i64)>,
) -> ApiResult<MembershipResponse> {
    api::remove_group_member(&state.api, GroupId(group_id), UserId(user_id))
        .await
        .map(Json)
        .map_err(reject)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
