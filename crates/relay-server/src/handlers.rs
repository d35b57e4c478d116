//! HTTP and WebSocket handlers for the Relay server.
//!
//! This module wires the hub, rate limiters and token verifier into an axum
//! router and runs it until a shutdown signal arrives.

use crate::auth::{AuthUser, JwtVerifier};
use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, ConnectionMetricsGuard, Metered};
use crate::middleware::{limit_api, limit_upgrades, log_requests, require_auth};
use crate::store;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocket, ConnectInfo, Path, State, WebSocketUpgrade},
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use relay_core::{validate_room_id, Hub, HubHandle, RateLimiter, UserId, WindowStore};
use relay_transport::{pump, websocket, TransportError, WriteEnd};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the running hub.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    /// Token verifier.
    pub verifier: JwtVerifier,
    /// Per-IP limit on WebSocket upgrades.
    pub upgrade_limiter: RateLimiter,
    /// Per-user limit on room management.
    pub api_limiter: RateLimiter,
    /// Store behind both limiters.
    pub store: Arc<dyn WindowStore>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle, store: Arc<dyn WindowStore>) -> Self {
        let upgrade_limiter = RateLimiter::new(
            Arc::clone(&store),
            config.rate_limit.upgrade.to_rate_limit(),
        );
        let api_limiter = RateLimiter::new(Arc::clone(&store), config.rate_limit.api.to_rate_limit());

        Self {
            hub,
            verifier: JwtVerifier::new(config.auth.jwt_secret.as_bytes()),
            upgrade_limiter,
            api_limiter,
            store,
            config,
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    // Layers run bottom-up: the rate limit sees the upgrade before auth does.
    let ws = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route_layer(from_fn_with_state(Arc::clone(&state), require_auth))
        .route_layer(from_fn_with_state(Arc::clone(&state), limit_upgrades));

    // Auth first, so the limit can key on the user.
    let rooms = Router::new()
        .route("/rooms/:room_id", put(put_room).delete(delete_room))
        .route("/rooms/:room_id/members", post(add_member))
        .route("/rooms/:room_id/members/:user_id", delete(remove_member))
        .route_layer(from_fn_with_state(Arc::clone(&state), limit_api))
        .route_layer(from_fn_with_state(Arc::clone(&state), require_auth));

    Router::new()
        .merge(ws)
        .merge(rooms)
        .route("/health", get(health_handler))
        .route("/health/store", get(store_health_handler))
        .layer(from_fn(log_requests))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if the store cannot be built or the listener fails.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let store = store::build_store(&config.store)?;
    let (hub, hub_task) = Hub::spawn(&config.hub.to_hub_config());

    if config.metrics.enabled {
        metrics::spawn_hub_reporter(
            hub.clone(),
            Duration::from_millis(config.metrics.refresh_interval_ms.max(100)),
        );
    }

    let state = Arc::new(AppState::new(config.clone(), hub.clone(), store));
    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let stopping = hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, closing connections");
        // Closing every queue ends the write pumps, which closes the sockets
        // that would otherwise hold the server open.
        if stopping.shutdown().await.is_err() {
            debug!("Hub already stopped");
        }
    })
    .await?;

    if let Err(e) = hub_task.await {
        warn!(error = %e, "Hub task failed");
    }
    info!("Relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.hub.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "hub": stats,
            })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
    }
}

/// Rate-limit store health.
async fn store_health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let name = state.store.name();
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "store": name })),
        ),
        Err(e) => {
            warn!(store = name, error = %e, "Store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "store": name, "error": e.to_string() })),
            )
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let peer = connect_info.map(|info| info.0.to_string());
    let max_message_size = state.config.transport.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user.0, peer))
}

/// Serve an upgraded WebSocket until either side ends it.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: UserId,
    peer: Option<String>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sink, source) = websocket::split(socket, state.config.transport.max_message_size, peer);
    match pump::serve_connection(
        state.hub.clone(),
        user_id.clone(),
        Metered(source),
        Metered(sink),
        state.config.transport.write_timeout(),
    )
    .await
    {
        Ok(summary) => {
            if matches!(
                summary.write,
                Some(WriteEnd::Failed(TransportError::WriteTimeout(_)))
            ) {
                metrics::record_error("write_timeout");
            }
            debug!(connection = %summary.key, read = ?summary.read, write = ?summary.write, "WebSocket finished");
        }
        Err(e) => {
            warn!(user = %user_id, error = %e, "Rejected WebSocket, hub unavailable");
            metrics::record_error("hub_closed");
        }
    }
}

/// Body of `PUT /rooms/:room_id`.
#[derive(Debug, Deserialize)]
pub struct RoomMembers {
    /// Full membership of the room.
    pub members: Vec<UserId>,
}

/// Body of `POST /rooms/:room_id/members`.
#[derive(Debug, Deserialize)]
pub struct NewMember {
    /// User to add.
    pub user_id: UserId,
}

fn check_room_id(room_id: &str) -> Result<(), ApiError> {
    validate_room_id(room_id).map_err(|reason| ApiError::BadRequest(format!("invalid room id: {}", reason)))
}

fn check_user_id(user_id: &str) -> Result<(), ApiError> {
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id must not be empty".to_string()));
    }
    Ok(())
}

/// Create a room or replace its membership.
async fn put_room(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<String>,
    Json(body): Json<RoomMembers>,
) -> Result<StatusCode, ApiError> {
    check_room_id(&room_id)?;
    for member in &body.members {
        check_user_id(member)?;
    }

    info!(room = %room_id, by = %user.0, members = body.members.len(), "Set room members");
    state.hub.create_room(room_id, body.members).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Add one member to an existing room.
async fn add_member(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<String>,
    Json(body): Json<NewMember>,
) -> Result<StatusCode, ApiError> {
    check_room_id(&room_id)?;
    check_user_id(&body.user_id)?;

    info!(room = %room_id, by = %user.0, member = %body.user_id, "Add room member");
    state.hub.add_room_member(room_id, body.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Remove one member from a room.
async fn remove_member(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path((room_id, member)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    check_room_id(&room_id)?;
    check_user_id(&member)?;

    info!(room = %room_id, by = %user.0, member = %member, "Remove room member");
    state.hub.remove_room_member(room_id, member).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Delete a room.
async fn delete_room(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    check_room_id(&room_id)?;

    info!(room = %room_id, by = %user.0, "Delete room");
    state.hub.delete_room(room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
