//! Request middleware: authentication, rate limiting and request logging.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use relay_core::{Decision, RateLimiter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::handlers::AppState;
use crate::metrics;

/// Rate-limit key for a client address: the first `X-Forwarded-For` entry,
/// else the socket peer. `None` when neither is known.
#[must_use]
pub fn ip_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string);

    let ip = forwarded.or_else(|| peer.map(|addr| addr.ip().to_string()))?;
    Some(format!("rate:ip:{}", ip))
}

/// Rate-limit key for an authenticated user. `None` for an empty id.
#[must_use]
pub fn user_key(user_id: &str) -> Option<String> {
    (!user_id.is_empty()).then(|| format!("rate:user:{}", user_id))
}

/// Verify the request's token and attach an [`AuthUser`].
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let claims = state
        .verifier
        .authenticate(req.headers(), req.uri(), &state.config.auth.cookie_name)
        .map_err(|e| {
            debug!(path = %req.uri().path(), error = %e, "Rejected unauthenticated request");
            e
        })?;

    req.extensions_mut().insert(AuthUser(claims.user_id));
    Ok(next.run(req).await)
}

/// Limit WebSocket upgrades per client IP.
pub async fn limit_upgrades(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = ip_key(req.headers(), peer);
    gate(&state.upgrade_limiter, "upgrade", key, req, next).await
}

/// Limit API calls per authenticated user. Runs after [`require_auth`].
pub async fn limit_api(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let key = req
        .extensions()
        .get::<AuthUser>()
        .and_then(|user| user_key(&user.0));
    gate(&state.api_limiter, "api", key, req, next).await
}

async fn gate(
    limiter: &RateLimiter,
    scope: &'static str,
    key: Option<String>,
    req: Request,
    next: Next,
) -> Response {
    let Some(key) = key else {
        return next.run(req).await;
    };

    match limiter.check(&key).await {
        Decision::Allowed => next.run(req).await,
        Decision::Rejected => {
            info!(key = %key, scope, "Rate limited");
            metrics::record_rate_limited(scope);
            ApiError::RateLimited.into_response()
        }
    }
}

/// Log one line per request.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "HTTP request"
    );
    response
}
