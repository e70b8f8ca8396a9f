pub mod auth;
pub mod error;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::hub::Hub;
use crate::idle::IdleTracker;
use crate::proxy::StreamProxy;
use crate::session::SessionStore;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub dispatcher: Dispatcher,
    pub hub: Hub,
    pub idle: IdleTracker,
    pub proxy: StreamProxy,
    /// Cancelled when the process shuts down; long-lived sockets close on it.
    pub shutdown: CancellationToken,
}

pub(crate) fn find_session(
    sessions: &SessionStore,
    id: &str,
) -> Result<crate::session::Session, error::ApiError> {
    sessions
        .get(id)
        .ok_or_else(|| error::ApiError::SessionNotFound(id.to_string()))
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a minimal no-auth setup.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Bearer token for the session/command API.
    pub api_token: Option<String>,
    /// Bearer token for `/internal/*` peer routes.
    pub cluster_token: Option<String>,
    pub cors_origins: Vec<String>,
}

fn with_token(router: Router, token: Option<String>) -> Router {
    match token {
        // Route layer: unmatched paths fall through to a plain 404.
        Some(token) => router.route_layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { auth::require_auth(t, req, next).await }
        })),
        None => router,
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let api = Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/commands", get(list_commands).post(dispatch_command))
        .route("/sessions/{id}/transition", post(transition_session))
        .route("/sessions/{id}/touch", post(touch_session))
        .route("/sessions/{id}/stream-token", post(stream_token))
        .route("/commands/{id}", get(get_command))
        .route("/agents", get(list_agents))
        .route("/events", get(events))
        .with_state(state.clone());
    let api = with_token(api, config.api_token);

    // Peer forwarding is only served when a cluster token guards it.
    let internal = match config.cluster_token {
        Some(token) => with_token(
            Router::new()
                .route("/internal/route", post(internal_route))
                .route("/internal/ack", post(internal_ack))
                .route("/internal/tunnel", post(internal_tunnel))
                .with_state(state.clone()),
            Some(token),
        ),
        None => Router::new(),
    };

    // Agents and stream clients carry their own credentials.
    let open = Router::new()
        .route("/health", get(health))
        .route("/agent/connect", get(agent_connect))
        .route("/agent/tunnel/{id}", get(agent_tunnel))
        .route("/sessions/{id}/stream", get(open_stream))
        .with_state(state);

    let router = Router::new()
        .merge(open)
        .merge(api)
        .merge(internal)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store"),
        ));

    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}
