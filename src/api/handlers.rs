use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::dispatch::Command;
use crate::hub::{AgentRecord, ForwardedCommand, ForwardedTunnel};
use crate::protocol::{CommandAck, CommandType};
use crate::proxy::{Duplex, StreamGrant};
use crate::session::{NewSession, Session, SessionState};

use super::auth::extract_bearer;
use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    process_id: String,
    agents_connected: usize,
    sessions: usize,
    commands_in_flight: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let agents = state.hub.directory().list();
    Json(HealthResponse {
        status: "ok",
        process_id: state.hub.process_id().to_string(),
        agents_connected: agents.iter().filter(|a| state.hub.is_local(&a.id)).count(),
        sessions: state.sessions.len(),
        commands_in_flight: state.dispatcher.in_flight(),
    })
}

// ── Agents ─────────────────────────────────────────────────────────

pub(super) async fn agent_connect(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::hub::connection::serve_agent(socket, state.hub, state.shutdown))
}

pub(super) async fn agent_tunnel(
    ws: WebSocketUpgrade,
    Path(tunnel_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let token = extract_bearer(&headers).ok_or(ApiError::AuthRequired)?;
    state.hub.authorize_tunnel(&tunnel_id, &token).map_err(|e| {
        tracing::warn!(tunnel = %tunnel_id, error = %e, "tunnel dial-back refused");
        ApiError::AuthInvalid
    })?;
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = state.hub.attach_tunnel(&tunnel_id, Duplex::from_axum(socket)) {
            tracing::warn!(tunnel = %tunnel_id, error = %e, "tunnel arrived too late");
        }
    }))
}

pub(super) async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentRecord>> {
    Json(state.hub.directory().list())
}

// ── Sessions ───────────────────────────────────────────────────────

pub(super) async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<NewSession>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    if req.owner_id.trim().is_empty() {
        return Err(ApiError::InvalidRequest("owner_id must not be empty".into()));
    }
    let session = state.sessions.create(req)?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub(super) async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.sessions.list())
}

pub(super) async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    super::find_session(&state.sessions, &id).map(Json)
}

#[derive(Deserialize)]
pub(super) struct TransitionRequest {
    to: SessionState,
    #[serde(default)]
    reason: Option<String>,
}

pub(super) async fn transition_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<Session>, ApiError> {
    let applied = state.sessions.transition(&id, req.to, req.reason)?;
    Ok(Json(applied.session))
}

#[derive(Serialize)]
pub(super) struct TouchResponse {
    last_activity_at: chrono::DateTime<chrono::Utc>,
}

pub(super) async fn touch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TouchResponse>, ApiError> {
    let last_activity_at = state.idle.touch(&id)?;
    Ok(Json(TouchResponse { last_activity_at }))
}

// ── Commands ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct DispatchRequest {
    #[serde(rename = "type")]
    command_type: CommandType,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Serialize)]
pub(super) struct DispatchResponse {
    command_id: String,
}

pub(super) async fn dispatch_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let command_id = state
        .dispatcher
        .dispatch(&id, req.command_type, req.payload)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(DispatchResponse { command_id })))
}

pub(super) async fn list_commands(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Command>>, ApiError> {
    super::find_session(&state.sessions, &id)?;
    Ok(Json(state.dispatcher.list_commands(&id)))
}

pub(super) async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Command>, ApiError> {
    state
        .dispatcher
        .get_command(&id)
        .map(Json)
        .ok_or(ApiError::CommandNotFound(id))
}

// ── Streams ────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub(super) struct StreamTokenRequest {
    /// Defaults to the session owner.
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Serialize)]
pub(super) struct StreamTokenResponse {
    token: String,
    expires_in_secs: u64,
}

pub(super) async fn stream_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StreamTokenRequest>,
) -> Result<Json<StreamTokenResponse>, ApiError> {
    let session = super::find_session(&state.sessions, &id)?;
    let user_id = req.user_id.unwrap_or(session.owner_id);
    let token = state.proxy.issue_token(&id, &user_id)?;
    Ok(Json(StreamTokenResponse {
        token,
        expires_in_secs: state.proxy.token_ttl().as_secs(),
    }))
}

#[derive(Deserialize)]
pub(super) struct StreamQuery {
    token: String,
}

/// Client side of the stream proxy. The token is checked before upgrading.
pub(super) async fn open_stream(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let grant = state.proxy.authorize(&id, &query.token).await?;
    Ok(ws.on_upgrade(move |socket| serve_stream(socket, state, grant)))
}

async fn serve_stream(mut socket: WebSocket, state: AppState, grant: StreamGrant) {
    let agent = match state.proxy.open_tunnel(&grant).await {
        Ok(duplex) => duplex,
        Err(e) => {
            tracing::warn!(session = %grant.session_id, error = %e, "could not open tunnel");
            let close_frame = CloseFrame {
                code: axum::extract::ws::close_code::AGAIN,
                reason: e.to_string().chars().take(120).collect::<String>().into(),
            };
            let _ = socket.send(Message::Close(Some(close_frame))).await;
            return;
        }
    };
    state.proxy.run(grant, Duplex::from_axum(socket), agent).await;
}

// ── Event feed ─────────────────────────────────────────────────────

pub(super) async fn events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_events(socket, state))
}

async fn handle_events(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut sessions = state.sessions.subscribe();
    let mut hub = state.hub.subscribe();

    loop {
        let frame = tokio::select! {
            ev = sessions.recv() => match ev {
                Ok(ev) => serde_json::to_string(&ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event feed lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            ev = hub.recv() => match ev {
                Ok(ev) => serde_json::to_string(&ev),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            },
            _ = state.shutdown.cancelled() => {
                let close_frame = CloseFrame {
                    code: axum::extract::ws::close_code::NORMAL,
                    reason: "server shutting down".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                break;
            }
        };
        let Ok(text) = frame else { continue };
        if ws_tx.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

// ── Peer forwarding ────────────────────────────────────────────────

pub(super) async fn internal_route(
    State(state): State<AppState>,
    Json(fwd): Json<ForwardedCommand>,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(origin = %fwd.origin, agent = %fwd.agent_id, command = %fwd.command.id, "forwarded command");
    state.hub.accept_forwarded_command(fwd).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn internal_ack(
    State(state): State<AppState>,
    Json(ack): Json<CommandAck>,
) -> StatusCode {
    state.hub.resolve_ack(ack);
    StatusCode::NO_CONTENT
}

pub(super) async fn internal_tunnel(
    State(state): State<AppState>,
    Json(fwd): Json<ForwardedTunnel>,
) -> Result<StatusCode, ApiError> {
    state.hub.accept_forwarded_tunnel(fwd).await?;
    Ok(StatusCode::NO_CONTENT)
}
