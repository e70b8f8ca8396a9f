//! Reference agent.
//!
//! Holds one persistent WebSocket to a control plane:
//! - Connects to `{server}/agent/connect` and registers
//! - Sends heartbeats at the interval the control plane grants
//! - Executes commands one at a time through an [`Executor`], acking each;
//!   an id it has already applied is acked again without re-executing
//! - Answers tunnel requests by dialing back to the callback URL and piping
//!   the session's workload TCP port over that socket
//! - On disconnect, retries with exponential backoff (1s..60s)

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::protocol::{AgentCommand, AgentMessage, CommandAck, CommandType, Platform, ServerMessage, TunnelRequest};
use crate::proxy::relay::{relay, Duplex, RelayLimits};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Applies commands to the local workload platform.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Carry out `command`. `Ok` carries an optional detail for the ack; the
    /// detail of a `start` is recorded as the session's workload reference.
    async fn execute(&self, command: &AgentCommand) -> anyhow::Result<Option<String>>;

    /// `host:port` of the workload serving `session_id`, if it has one here.
    fn workload_addr(&self, session_id: &str) -> Option<String>;
}

/// Executor that only records what it was asked to do. Every session's
/// stream is served by one fixed address.
#[derive(Default)]
pub struct StaticExecutor {
    addr: Option<String>,
    failing: HashSet<CommandType>,
    executed: Mutex<Vec<AgentCommand>>,
}

impl StaticExecutor {
    pub fn new(addr: Option<String>) -> Self {
        Self {
            addr,
            ..Default::default()
        }
    }

    /// Make every command of `command_type` fail.
    pub fn failing(mut self, command_type: CommandType) -> Self {
        self.failing.insert(command_type);
        self
    }

    pub fn executed(&self) -> Vec<AgentCommand> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl Executor for StaticExecutor {
    async fn execute(&self, command: &AgentCommand) -> anyhow::Result<Option<String>> {
        self.executed.lock().push(command.clone());
        if self.failing.contains(&command.command_type) {
            anyhow::bail!("{} is not supported here", command.command_type);
        }
        Ok(match command.command_type {
            CommandType::Start => Some(format!("workload/{}", command.session_id)),
            _ => None,
        })
    }

    fn workload_addr(&self, _session_id: &str) -> Option<String> {
        self.addr.clone()
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Control-plane base URL (`http://`, `https://`, `ws://` or `wss://`).
    pub server_url: String,
    pub agent_id: String,
    pub token: String,
    pub platform: Platform,
    pub capabilities: Vec<String>,
    pub capacity: Option<u32>,
    /// Requested heartbeat interval; the control plane has the last word.
    pub heartbeat_interval_secs: Option<u64>,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// How many applied command ids are remembered for duplicate detection.
    pub applied_capacity: usize,
    pub registration_timeout: Duration,
}

impl AgentSettings {
    pub fn new(server_url: impl Into<String>, agent_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            agent_id: agent_id.into(),
            token: token.into(),
            platform: Platform::Docker,
            capabilities: Vec::new(),
            capacity: None,
            heartbeat_interval_secs: None,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            applied_capacity: 1024,
            registration_timeout: Duration::from_secs(10),
        }
    }

    fn connect_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/agent/connect")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

/// Acks of commands already applied, oldest evicted first.
struct AppliedCache {
    acks: HashMap<String, CommandAck>,
    order: VecDeque<String>,
    capacity: usize,
}

impl AppliedCache {
    fn new(capacity: usize) -> Self {
        Self {
            acks: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, id: &str) -> Option<CommandAck> {
        self.acks.get(id).cloned()
    }

    fn insert(&mut self, ack: CommandAck) {
        if self.acks.insert(ack.id.clone(), ack.clone()).is_none() {
            self.order.push_back(ack.id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.acks.remove(&old);
            }
        }
    }
}

pub struct AgentClient<E: Executor> {
    settings: AgentSettings,
    executor: Arc<E>,
    applied: Arc<Mutex<AppliedCache>>,
}

impl<E: Executor> AgentClient<E> {
    pub fn new(settings: AgentSettings, executor: Arc<E>) -> Self {
        let applied = AppliedCache::new(settings.applied_capacity);
        Self {
            settings,
            executor,
            applied: Arc::new(Mutex::new(applied)),
        }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Connect, serve, reconnect; returns once `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = self.settings.min_backoff;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect_once(&cancel).await {
                Ok(registered) => {
                    if registered {
                        backoff = self.settings.min_backoff;
                    }
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!(agent = %self.settings.agent_id, "control plane connection lost");
                }
                Err(AgentError::Rejected(reason)) => {
                    tracing::error!(agent = %self.settings.agent_id, reason = %reason, "registration rejected");
                }
                Err(e) => {
                    tracing::debug!(agent = %self.settings.agent_id, error = %e, "connection failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }
    }

    /// One connection from dial to teardown. `Ok(true)` if registration
    /// succeeded before the connection ended.
    async fn connect_once(&self, cancel: &CancellationToken) -> Result<bool, AgentError> {
        let url = self.settings.connect_url();
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let register = AgentMessage::Register {
            agent_id: self.settings.agent_id.clone(),
            auth_token: self.settings.token.clone(),
            platform: self.settings.platform,
            capabilities: self.settings.capabilities.clone(),
            capacity: self.settings.capacity,
            heartbeat_interval_secs: self.settings.heartbeat_interval_secs,
        };
        sink.send(Message::text(register.encode())).await?;

        let heartbeat_secs = match tokio::time::timeout(
            self.settings.registration_timeout,
            next_server_message(&mut stream),
        )
        .await
        {
            Ok(Ok(ServerMessage::Registered {
                heartbeat_interval_secs,
                ..
            })) => heartbeat_interval_secs,
            Ok(Ok(ServerMessage::Rejected { reason })) => return Err(AgentError::Rejected(reason)),
            Ok(Ok(other)) => {
                return Err(AgentError::Protocol(format!("expected registered, got {other:?}")))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(AgentError::Protocol("registration timed out".into())),
        };
        tracing::info!(agent = %self.settings.agent_id, url = %url, heartbeat_secs, "registered with control plane");

        let conn_cancel = cancel.child_token();
        let (out_tx, mut out_rx) = mpsc::channel::<AgentMessage>(64);
        let (cmd_tx, cmd_rx) = mpsc::channel::<AgentCommand>(256);
        let worker = tokio::spawn(command_worker(
            self.executor.clone(),
            self.applied.clone(),
            cmd_rx,
            out_tx.clone(),
        ));

        let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));
        heartbeat.tick().await; // Skip the first immediate tick.

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let draining = AgentMessage::Draining { agent_id: self.settings.agent_id.clone() };
                    let _ = sink.send(Message::text(draining.encode())).await;
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    let beat = AgentMessage::Heartbeat { agent_id: self.settings.agent_id.clone() };
                    if sink.send(Message::text(beat.encode())).await.is_err() {
                        break;
                    }
                }
                out = out_rx.recv() => {
                    let Some(frame) = out else { break };
                    if sink.send(Message::text(frame.encode())).await.is_err() {
                        break;
                    }
                }
                msg = next_server_message(&mut stream) => match msg {
                    Ok(ServerMessage::Command { command }) => {
                        tracing::debug!(command = %command.id, session = %command.session_id, kind = %command.command_type, "command received");
                        if cmd_tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Ok(ServerMessage::TunnelRequest(request)) => {
                        tokio::spawn(serve_tunnel(
                            self.executor.clone(),
                            self.settings.token.clone(),
                            request,
                            out_tx.clone(),
                            conn_cancel.child_token(),
                        ));
                    }
                    Ok(other) => {
                        tracing::warn!(agent = %self.settings.agent_id, frame = ?other, "unexpected frame");
                    }
                    Err(AgentError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(agent = %self.settings.agent_id, error = %e, "dropping connection");
                        break;
                    }
                },
            }
        }

        conn_cancel.cancel();
        worker.abort();
        Ok(true)
    }
}

/// Next control-plane frame, skipping pings and pongs.
async fn next_server_message(
    stream: &mut futures::stream::SplitStream<WsStream>,
) -> Result<ServerMessage, AgentError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return ServerMessage::decode(text.as_str())
                    .map_err(|e| AgentError::Protocol(e.to_string()));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(AgentError::Closed),
            Some(Ok(_)) => return Err(AgentError::Protocol("unexpected non-text frame".into())),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Applies commands strictly one after another.
async fn command_worker<E: Executor>(
    executor: Arc<E>,
    applied: Arc<Mutex<AppliedCache>>,
    mut commands: mpsc::Receiver<AgentCommand>,
    out: mpsc::Sender<AgentMessage>,
) {
    while let Some(command) = commands.recv().await {
        let cached = applied.lock().get(&command.id);
        let ack = match cached {
            Some(ack) => {
                tracing::debug!(command = %command.id, "already applied; re-acking");
                ack
            }
            None => {
                let ack = match executor.execute(&command).await {
                    Ok(detail) => CommandAck::success(&command.id, detail),
                    Err(e) => {
                        tracing::warn!(command = %command.id, error = %e, "command failed");
                        CommandAck::failure(&command.id, e.to_string())
                    }
                };
                applied.lock().insert(ack.clone());
                ack
            }
        };
        if out.send(AgentMessage::CommandAck(ack)).await.is_err() {
            return;
        }
    }
}

async fn serve_tunnel<E: Executor>(
    executor: Arc<E>,
    token: String,
    request: TunnelRequest,
    out: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
) {
    let tunnel_id = request.tunnel_id.clone();
    match open_tunnel(executor.as_ref(), &token, &request).await {
        Ok((endpoint, ws, tcp)) => {
            let _ = out
                .send(AgentMessage::TunnelReady {
                    tunnel_id: tunnel_id.clone(),
                    endpoint,
                })
                .await;
            let report = relay(
                ws_duplex(ws),
                tcp_duplex(tcp),
                RelayLimits::default(),
                cancel,
                Arc::new(|| {}),
            )
            .await;
            tracing::debug!(tunnel = %tunnel_id, end = ?report.end, "tunnel closed");
        }
        Err(reason) => {
            tracing::warn!(tunnel = %tunnel_id, session = %request.session_id, reason = %reason, "tunnel failed");
            let _ = out.send(AgentMessage::TunnelError { tunnel_id, reason }).await;
        }
    }
}

async fn open_tunnel<E: Executor>(
    executor: &E,
    token: &str,
    request: &TunnelRequest,
) -> Result<(String, WsStream, TcpStream), String> {
    let endpoint = executor
        .workload_addr(&request.session_id)
        .ok_or_else(|| format!("no workload for session {}", request.session_id))?;
    let tcp = TcpStream::connect(&endpoint)
        .await
        .map_err(|e| format!("workload {endpoint} unreachable: {e}"))?;

    let mut req = request
        .callback_url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("bad callback url: {e}"))?;
    let auth = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| format!("bad token: {e}"))?;
    req.headers_mut().insert(header::AUTHORIZATION, auth);
    let (ws, _) = tokio_tungstenite::connect_async(req)
        .await
        .map_err(|e| format!("dial-back failed: {e}"))?;
    Ok((endpoint, ws, tcp))
}

fn ws_duplex(ws: WsStream) -> Duplex {
    let (tx, rx) = ws.split();
    let reader = rx
        .take_while(|msg| futures::future::ready(matches!(msg, Ok(m) if !m.is_close())))
        .filter_map(|msg| {
            futures::future::ready(match msg {
                Ok(Message::Binary(data)) => Some(data),
                Ok(Message::Text(text)) => Some(Bytes::copy_from_slice(text.as_str().as_bytes())),
                _ => None,
            })
        });
    let writer = tx
        .sink_map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
        .with(|data: Bytes| futures::future::ready(Ok::<_, std::io::Error>(Message::Binary(data))));
    Duplex::new(reader, writer)
}

fn tcp_duplex(tcp: TcpStream) -> Duplex {
    let (r, w) = tcp.into_split();
    let reader = FramedRead::new(r, BytesCodec::new())
        .take_while(|chunk| futures::future::ready(chunk.is_ok()))
        .filter_map(|chunk| futures::future::ready(chunk.ok().map(|b| b.freeze())));
    Duplex::new(reader, FramedWrite::new(w, BytesCodec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(id: &str, command_type: CommandType) -> AgentCommand {
        AgentCommand {
            id: id.into(),
            session_id: "s1".into(),
            command_type,
            payload: json!({}),
        }
    }

    #[test]
    fn connect_url_switches_scheme() {
        let s = AgentSettings::new("http://cp:8080/", "a", "t");
        assert_eq!(s.connect_url(), "ws://cp:8080/agent/connect");
        let s = AgentSettings::new("https://cp.example", "a", "t");
        assert_eq!(s.connect_url(), "wss://cp.example/agent/connect");
        let s = AgentSettings::new("ws://cp:1", "a", "t");
        assert_eq!(s.connect_url(), "ws://cp:1/agent/connect");
    }

    #[test]
    fn applied_cache_evicts_oldest() {
        let mut cache = AppliedCache::new(2);
        cache.insert(CommandAck::success("c1", None));
        cache.insert(CommandAck::success("c2", None));
        cache.insert(CommandAck::success("c3", None));
        assert!(cache.get("c1").is_none());
        assert!(cache.get("c2").is_some());
        assert!(cache.get("c3").is_some());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_acked_without_reexecuting() {
        let executor = Arc::new(StaticExecutor::new(None));
        let applied = Arc::new(Mutex::new(AppliedCache::new(16)));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        tokio::spawn(command_worker(executor.clone(), applied, cmd_rx, out_tx));

        cmd_tx.send(command("c1", CommandType::Start)).await.unwrap();
        cmd_tx.send(command("c1", CommandType::Start)).await.unwrap();

        for _ in 0..2 {
            match out_rx.recv().await.unwrap() {
                AgentMessage::CommandAck(ack) => {
                    assert_eq!(ack.id, "c1");
                    assert_eq!(ack.detail.as_deref(), Some("workload/s1"));
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(executor.executed().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_acked_as_failure() {
        let executor = Arc::new(StaticExecutor::new(None).failing(CommandType::Wake));
        let applied = Arc::new(Mutex::new(AppliedCache::new(16)));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        tokio::spawn(command_worker(executor, applied, cmd_rx, out_tx));

        cmd_tx.send(command("c1", CommandType::Wake)).await.unwrap();
        let Some(AgentMessage::CommandAck(ack)) = out_rx.recv().await else {
            panic!("expected an ack");
        };
        assert_eq!(ack.status, crate::protocol::AckStatus::Failure);
        assert!(ack.detail.unwrap().contains("wake"));
    }

    #[tokio::test]
    async fn tunnel_without_workload_reports_error() {
        let executor = Arc::new(StaticExecutor::new(None));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let request = TunnelRequest {
            tunnel_id: "t1".into(),
            session_id: "s1".into(),
            callback_url: "ws://127.0.0.1:1/agent/tunnel/t1".into(),
        };
        serve_tunnel(executor, "tok".into(), request, out_tx, CancellationToken::new()).await;
        match out_rx.recv().await.unwrap() {
            AgentMessage::TunnelError { tunnel_id, reason } => {
                assert_eq!(tunnel_id, "t1");
                assert!(reason.contains("no workload"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
