pub mod auth;
pub mod error;
mod handlers;
pub mod limits;
pub mod origin;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::get,
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::registry::SessionRegistry;

use auth::TokenStore;
use handlers::*;
use limits::{ConnectionTracker, RateLimiter};

pub use handlers::CLOSE_TRY_AGAIN_LATER;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub tokens: Arc<TokenStore>,
    pub limiter: Arc<RateLimiter>,
    pub connections: Arc<ConnectionTracker>,
    /// Server ping cadence on the push channel.
    pub keepalive_interval: Duration,
    /// Fired on shutdown; open push channels close with a normal close frame.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(registry: SessionRegistry, config: &Config, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            tokens: Arc::new(TokenStore::load(&config.token_path)),
            limiter: Arc::new(RateLimiter::new(config.rate_limit, config.rate_window())),
            connections: Arc::new(ConnectionTracker::new(config.max_ws_connections_per_ip)),
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms.max(1)),
            shutdown,
        }
    }
}

/// Build the gateway router.
///
/// Request path, outermost first: tracing and response headers, per-IP rate
/// limit, CORS grant and preflight, token auth, then `/status`, `/ws`, or 404.
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// rate limiter sees the peer address.
pub fn router(state: AppState) -> Router {
    let tokens = state.tokens.clone();
    let limiter = state.limiter.clone();

    Router::new()
        .route("/status", get(status))
        .route("/ws", get(ws))
        .fallback(not_found)
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(tokens, auth::require_auth))
        .layer(axum::middleware::from_fn(origin::cors))
        .layer(axum::middleware::from_fn_with_state(limiter, limits::rate_limit))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
}
