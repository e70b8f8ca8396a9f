use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::dispatch::DispatchError;
use crate::hub::{HubError, RouteError};
use crate::proxy::ProxyError;
use crate::session::StoreError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 404 - A specific command id was not found.
    CommandNotFound(String),
    /// 409 - Session id already exists.
    SessionConflict(String),
    /// 409 - The transition table does not allow this.
    InvalidTransition(String),
    /// 409 - The agent is not connected to this process.
    AgentNotConnected(String),
    /// 503 - Not accepting commands while shutting down.
    Draining,
    /// 401 - Stream token missing, forged, expired or for another session.
    StreamTokenInvalid(String),
    /// 503 - The session is being woken; the client should retry.
    SessionWaking(String),
    /// 409 - The session cannot be streamed in its current state.
    SessionNotRunning(String),
    /// 502 - The agent could not provide a tunnel.
    TunnelFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::CommandNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionConflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidTransition(_) => StatusCode::CONFLICT,
            ApiError::AgentNotConnected(_) => StatusCode::CONFLICT,
            ApiError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::StreamTokenInvalid(_) => StatusCode::UNAUTHORIZED,
            ApiError::SessionWaking(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SessionNotRunning(_) => StatusCode::CONFLICT,
            ApiError::TunnelFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::CommandNotFound(_) => "command_not_found",
            ApiError::SessionConflict(_) => "session_conflict",
            ApiError::InvalidTransition(_) => "invalid_transition",
            ApiError::AgentNotConnected(_) => "agent_not_connected",
            ApiError::Draining => "draining",
            ApiError::StreamTokenInvalid(_) => "stream_token_invalid",
            ApiError::SessionWaking(_) => "session_waking",
            ApiError::SessionNotRunning(_) => "session_not_running",
            ApiError::TunnelFailed(_) => "tunnel_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via the Authorization header.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::CommandNotFound(id) => format!("Command not found: {}.", id),
            ApiError::SessionConflict(id) => format!("Session already exists: {}.", id),
            ApiError::InvalidTransition(detail) => detail.clone(),
            ApiError::AgentNotConnected(id) => format!("Agent is not connected here: {}.", id),
            ApiError::Draining => "Control plane is shutting down; not accepting commands.".to_string(),
            ApiError::StreamTokenInvalid(detail) => format!("Stream rejected: {}.", detail),
            ApiError::SessionWaking(id) => {
                format!("Session {} is waking. Retry shortly.", id)
            }
            ApiError::SessionNotRunning(detail) => detail.clone(),
            ApiError::TunnelFailed(detail) => format!("Tunnel failed: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::SessionNotFound(id),
            StoreError::AlreadyExists(id) => ApiError::SessionConflict(id),
            StoreError::InvalidId(detail) => ApiError::InvalidRequest(detail),
            e @ StoreError::AlreadyAssigned { .. } => ApiError::InvalidTransition(e.to_string()),
            StoreError::Transition(e) => ApiError::InvalidTransition(e.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Draining => ApiError::Draining,
            DispatchError::Session(e) => e.into(),
            DispatchError::Transition(e) => ApiError::InvalidTransition(e.to_string()),
        }
    }
}

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NotConnected(agent) => ApiError::AgentNotConnected(agent),
            e => ApiError::InternalError(e.to_string()),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Token(e) => ApiError::StreamTokenInvalid(e.to_string()),
            e @ ProxyError::SessionMismatch => ApiError::StreamTokenInvalid(e.to_string()),
            ProxyError::SessionNotFound(id) => ApiError::SessionNotFound(id),
            ProxyError::Waking(id) => ApiError::SessionWaking(id),
            e @ (ProxyError::NotRunning { .. } | ProxyError::Unassigned(_)) => {
                ApiError::SessionNotRunning(e.to_string())
            }
            ProxyError::Tunnel(HubError::Route(RouteError::NotConnected(agent))) => {
                ApiError::TunnelFailed(format!("agent {agent} is not connected"))
            }
            ProxyError::Tunnel(e) => ApiError::TunnelFailed(e.to_string()),
            ProxyError::Dispatch(e) => e.into(),
        }
    }
}
