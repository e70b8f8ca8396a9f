#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use fleetd::agent::{AgentClient, AgentSettings, StaticExecutor};
use fleetd::api::AppState;
use fleetd::config::FleetConfig;
use fleetd::server::{ControlPlane, ServerOptions};

pub const FLEET_TOKEN: &str = "fleet-secret";
pub const STREAM_SECRET: &str = "stream-secret";

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Config with short timings so tests settle in milliseconds.
pub fn fast_config(process_id: &str) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.server.process_id = Some(process_id.to_string());
    config.server.stream_secret = Some(STREAM_SECRET.to_string());
    config.agents.fleet_token = Some(FLEET_TOKEN.to_string());
    config.agents.heartbeat_interval_secs = 1;
    config.dispatch.initial_backoff_ms = 50;
    config.dispatch.max_backoff_secs = 1;
    config.dispatch.scan_interval_ms = 20;
    config.dispatch.ack_timeout_secs = 2;
    config
}

/// A control plane serving on an ephemeral port.
pub struct TestPlane {
    pub addr: SocketAddr,
    pub state: AppState,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestPlane {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Trigger graceful shutdown and wait for the server to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.handle).await;
    }
}

pub async fn start_plane(config: FleetConfig, opts: ServerOptions) -> TestPlane {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let opts = ServerOptions {
        advertise_url: format!("http://{addr}"),
        drain_timeout: Duration::from_secs(1),
        ..opts
    };
    let plane = ControlPlane::build(&config, opts).await.unwrap();
    let state = plane.state().clone();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        plane
            .serve(listener, async {
                stop_rx.await.ok();
            })
            .await
            .unwrap();
    });
    TestPlane {
        addr,
        state,
        stop: Some(stop_tx),
        handle,
    }
}

pub async fn start_default_plane() -> TestPlane {
    start_plane(fast_config("cp-1"), ServerOptions::default()).await
}

/// A reference agent running in the background.
pub struct TestAgent {
    pub executor: Arc<StaticExecutor>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestAgent {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

pub fn agent_settings(plane: &TestPlane, agent_id: &str) -> AgentSettings {
    let mut settings = AgentSettings::new(plane.url(""), agent_id, FLEET_TOKEN);
    settings.heartbeat_interval_secs = Some(1);
    settings.min_backoff = Duration::from_millis(50);
    settings.max_backoff = Duration::from_millis(200);
    settings
}

pub fn start_agent(settings: AgentSettings, executor: StaticExecutor) -> TestAgent {
    let executor = Arc::new(executor);
    let client = AgentClient::new(settings, executor.clone());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(client.run(cancel.clone()));
    TestAgent {
        executor,
        cancel,
        handle,
    }
}

/// Open a raw agent socket and register. Returns the socket and the first
/// reply frame.
pub async fn raw_register(
    plane: &TestPlane,
    agent_id: &str,
    token: &str,
) -> (WsStream, serde_json::Value) {
    let (mut ws, _) = connect_async(plane.ws_url("/agent/connect")).await.unwrap();
    let register = serde_json::json!({
        "type": "register",
        "agentId": agent_id,
        "authToken": token,
        "platform": "docker",
        "capabilities": [],
        "capacity": 4,
    });
    ws.send(Message::text(register.to_string())).await.unwrap();
    let reply = next_json(&mut ws).await.expect("no reply to register");
    (ws, reply)
}

/// Next text frame as JSON, or None if the socket closed or nothing
/// arrived within two seconds.
pub async fn next_json(ws: &mut WsStream) -> Option<serde_json::Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .ok()??;
        match msg {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            _ => return None,
        }
    }
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub async fn create_session(plane: &TestPlane, id: &str, agent_id: Option<&str>) {
    let mut body = serde_json::json!({ "id": id, "owner_id": "user-1" });
    if let Some(agent) = agent_id {
        body["agent_id"] = agent.into();
    }
    let resp = reqwest::Client::new()
        .post(plane.url("/sessions"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
}

pub async fn dispatch(plane: &TestPlane, session: &str, command_type: &str) -> String {
    let resp = reqwest::Client::new()
        .post(plane.url(&format!("/sessions/{session}/commands")))
        .json(&serde_json::json!({ "type": command_type }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["command_id"].as_str().unwrap().to_string()
}

/// TCP server that writes back whatever it reads.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

pub async fn stream_token(plane: &TestPlane, session: &str) -> String {
    let resp = reqwest::Client::new()
        .post(plane.url(&format!("/sessions/{session}/stream-token")))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["token"].as_str().unwrap().to_string()
}

/// Send `payload` as a binary frame and collect binary frames until as many
/// bytes came back.
pub async fn echo_roundtrip(ws: &mut WsStream, payload: &[u8]) -> Vec<u8> {
    ws.send(Message::Binary(payload.to_vec().into())).await.unwrap();
    let mut received = Vec::new();
    while received.len() < payload.len() {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("echo timed out")
            .expect("stream closed")
            .unwrap();
        if let Message::Binary(data) = msg {
            received.extend_from_slice(&data);
        }
    }
    received
}
