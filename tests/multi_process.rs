//! Several control-plane processes sharing one routing table. Forwarding
//! between them runs in-process through `LoopbackPeers`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use common::*;
use fleetd::agent::StaticExecutor;
use fleetd::hub::{InMemoryRoutingTable, LoopbackPeers, RoutingTable};
use fleetd::server::ServerOptions;
use fleetd::session::SessionState;

struct Cluster {
    a: TestPlane,
    b: TestPlane,
    routing: Arc<InMemoryRoutingTable>,
}

async fn start_cluster() -> Cluster {
    let routing = Arc::new(InMemoryRoutingTable::new());
    let peers = LoopbackPeers::new();
    let opts = ServerOptions {
        routing: Some(routing.clone()),
        peers: Some(Arc::new(peers.clone())),
        ..Default::default()
    };
    let a = start_plane(fast_config("cp-a"), opts.clone()).await;
    let b = start_plane(fast_config("cp-b"), opts).await;
    peers.register(a.state.hub.clone());
    peers.register(b.state.hub.clone());
    Cluster { a, b, routing }
}

impl Cluster {
    async fn stop(self) {
        self.a.stop().await;
        self.b.stop().await;
    }
}

#[tokio::test]
async fn racing_registrations_leave_one_owner_and_routing_follows_it() {
    let cluster = start_cluster().await;

    let ((ws_a, reply_a), (ws_b, reply_b)) = tokio::join!(
        raw_register(&cluster.a, "agent-a", FLEET_TOKEN),
        raw_register(&cluster.b, "agent-a", FLEET_TOKEN),
    );
    assert_eq!(reply_a["type"], "registered");
    assert_eq!(reply_b["type"], "registered");

    let owner = cluster.routing.owner("agent-a").await.unwrap().unwrap();
    let (owner_ws, other) = match owner.process_id.as_str() {
        "cp-a" => (ws_a, &cluster.b),
        "cp-b" => (ws_b, &cluster.a),
        other => panic!("unexpected owner {other}"),
    };
    let mut owner_ws = owner_ws;

    // The process that lost the race dispatches; the command must reach the
    // socket held by the owner.
    create_session(other, "s1", Some("agent-a")).await;
    let command_id = dispatch(other, "s1", "start").await;

    let frame = next_json(&mut owner_ws).await.unwrap();
    assert_eq!(frame["type"], "command");
    assert_eq!(frame["command"]["id"], command_id.as_str());

    let ack = serde_json::json!({ "type": "commandAck", "id": command_id, "status": "success" });
    owner_ws.send(Message::text(ack.to_string())).await.unwrap();

    let sessions = other.state.sessions.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            sessions.get("s1").is_some_and(|s| s.state == SessionState::Running)
        })
        .await
    );
    assert_eq!(
        cluster.routing.owner("agent-a").await.unwrap().unwrap(),
        owner,
        "routing a command must not move ownership"
    );

    cluster.stop().await;
}

#[tokio::test]
async fn reconnect_to_another_process_takes_over() {
    let cluster = start_cluster().await;
    let first = start_agent(agent_settings(&cluster.a, "agent-a"), StaticExecutor::new(None));
    let hub_a = cluster.a.state.hub.clone();
    assert!(wait_until(Duration::from_secs(3), || hub_a.is_local("agent-a")).await);
    first.stop().await;

    let second = start_agent(agent_settings(&cluster.b, "agent-a"), StaticExecutor::new(None));
    let hub_b = cluster.b.state.hub.clone();
    assert!(wait_until(Duration::from_secs(3), || hub_b.is_local("agent-a")).await);
    let owner = cluster.routing.owner("agent-a").await.unwrap().unwrap();
    assert_eq!(owner.process_id, "cp-b");

    // A session living on cp-a is served through cp-b.
    create_session(&cluster.a, "s1", Some("agent-a")).await;
    dispatch(&cluster.a, "s1", "start").await;
    let sessions = cluster.a.state.sessions.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            sessions.get("s1").is_some_and(|s| s.state == SessionState::Running)
        })
        .await
    );
    assert_eq!(second.executor.executed().len(), 1);

    second.stop().await;
    cluster.stop().await;
}

#[tokio::test]
async fn stream_reaches_an_agent_held_by_a_peer() {
    let cluster = start_cluster().await;
    let echo = start_echo_server().await;
    let agent = start_agent(
        agent_settings(&cluster.a, "agent-a"),
        StaticExecutor::new(Some(echo.to_string())),
    );
    let hub_a = cluster.a.state.hub.clone();
    assert!(wait_until(Duration::from_secs(3), || hub_a.is_local("agent-a")).await);

    create_session(&cluster.b, "s1", Some("agent-a")).await;
    dispatch(&cluster.b, "s1", "start").await;
    let sessions = cluster.b.state.sessions.clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            sessions.get("s1").is_some_and(|s| s.state == SessionState::Running)
        })
        .await
    );

    let token = stream_token(&cluster.b, "s1").await;
    let (mut client, _) = connect_async(cluster.b.ws_url(&format!("/sessions/s1/stream?token={token}")))
        .await
        .unwrap();
    let echoed = echo_roundtrip(&mut client, b"across processes").await;
    assert_eq!(echoed, b"across processes");

    agent.stop().await;
    cluster.stop().await;
}
