//! Command dispatch end to end, against the reference agent.

mod common;

use std::time::Duration;

use common::*;
use fleetd::agent::StaticExecutor;
use fleetd::dispatch::CommandStatus;
use fleetd::protocol::CommandType;
use fleetd::session::SessionState;

async fn wait_for_state(plane: &TestPlane, session: &str, state: SessionState) -> bool {
    let sessions = plane.state.sessions.clone();
    wait_until(Duration::from_secs(5), || {
        sessions.get(session).is_some_and(|s| s.state == state)
    })
    .await
}

async fn wait_for_agent(plane: &TestPlane, agent: &str) -> bool {
    let hub = plane.state.hub.clone();
    let agent = agent.to_string();
    wait_until(Duration::from_secs(5), move || hub.is_local(&agent)).await
}

#[tokio::test]
async fn start_while_offline_is_delivered_after_connect() {
    let plane = start_default_plane().await;
    create_session(&plane, "s1", Some("agent-a")).await;
    let command_id = dispatch(&plane, "s1", "start").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let command = plane.state.dispatcher.get_command(&command_id).unwrap();
    assert_eq!(command.status, CommandStatus::Pending);
    assert_eq!(plane.state.sessions.get("s1").unwrap().state, SessionState::Requested);

    let agent = start_agent(agent_settings(&plane, "agent-a"), StaticExecutor::new(None));
    assert!(wait_for_state(&plane, "s1", SessionState::Running).await);

    let command = plane.state.dispatcher.get_command(&command_id).unwrap();
    assert_eq!(command.status, CommandStatus::Acked);
    assert_eq!(
        plane.state.sessions.get("s1").unwrap().workload_ref.as_deref(),
        Some("workload/s1")
    );
    assert_eq!(agent.executor.executed().len(), 1);

    agent.stop().await;
    plane.stop().await;
}

#[tokio::test]
async fn unassigned_session_is_scheduled_onto_a_connected_agent() {
    let plane = start_default_plane().await;
    let agent = start_agent(agent_settings(&plane, "agent-b"), StaticExecutor::new(None));
    assert!(wait_for_agent(&plane, "agent-b").await);

    create_session(&plane, "s1", None).await;
    dispatch(&plane, "s1", "create").await;
    assert!(wait_for_state(&plane, "s1", SessionState::Running).await);
    assert_eq!(
        plane.state.sessions.get("s1").unwrap().agent_id.as_deref(),
        Some("agent-b")
    );

    agent.stop().await;
    plane.stop().await;
}

#[tokio::test]
async fn lifecycle_commands_execute_in_order() {
    let plane = start_default_plane().await;
    let agent = start_agent(agent_settings(&plane, "agent-a"), StaticExecutor::new(None));
    assert!(wait_for_agent(&plane, "agent-a").await);
    create_session(&plane, "s1", Some("agent-a")).await;

    dispatch(&plane, "s1", "start").await;
    assert!(wait_for_state(&plane, "s1", SessionState::Running).await);
    dispatch(&plane, "s1", "hibernate").await;
    assert!(wait_for_state(&plane, "s1", SessionState::Hibernated).await);
    dispatch(&plane, "s1", "wake").await;
    assert!(wait_for_state(&plane, "s1", SessionState::Running).await);
    dispatch(&plane, "s1", "stop").await;
    assert!(wait_for_state(&plane, "s1", SessionState::Stopped).await);

    let kinds: Vec<CommandType> = agent
        .executor
        .executed()
        .iter()
        .map(|c| c.command_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            CommandType::Start,
            CommandType::Hibernate,
            CommandType::Wake,
            CommandType::Stop
        ]
    );
    let commands = plane.state.dispatcher.list_commands("s1");
    assert_eq!(commands.len(), 4);
    assert!(commands.iter().all(|c| c.status == CommandStatus::Acked));

    agent.stop().await;
    plane.stop().await;
}

#[tokio::test]
async fn agent_failure_fails_the_session_without_retry() {
    let plane = start_default_plane().await;
    let agent = start_agent(
        agent_settings(&plane, "agent-a"),
        StaticExecutor::new(None).failing(CommandType::Start),
    );
    assert!(wait_for_agent(&plane, "agent-a").await);
    create_session(&plane, "s1", Some("agent-a")).await;

    let command_id = dispatch(&plane, "s1", "start").await;
    assert!(wait_for_state(&plane, "s1", SessionState::Failed).await);

    let command = plane.state.dispatcher.get_command(&command_id).unwrap();
    assert_eq!(command.status, CommandStatus::Failed);
    assert_eq!(command.attempt_count, 1);
    let reason = plane.state.sessions.get("s1").unwrap().failure_reason.unwrap();
    assert!(reason.contains("not supported"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.executor.executed().len(), 1);

    agent.stop().await;
    plane.stop().await;
}

#[tokio::test]
async fn invalid_intent_is_refused_over_http() {
    let plane = start_default_plane().await;
    create_session(&plane, "s1", None).await;
    let resp = reqwest::Client::new()
        .post(plane.url("/sessions/s1/commands"))
        .json(&serde_json::json!({ "type": "wake" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_transition");
    plane.stop().await;
}
