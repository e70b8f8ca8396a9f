//! Idle sessions are hibernated through the normal command path.

mod common;

use std::time::Duration;

use common::*;
use fleetd::agent::StaticExecutor;
use fleetd::protocol::CommandType;
use fleetd::server::ServerOptions;
use fleetd::session::SessionState;

#[tokio::test]
async fn idle_running_session_is_hibernated_once() {
    let mut config = fast_config("cp-1");
    config.idle.threshold_secs = 1;
    config.idle.sweep_interval_secs = 1;
    let plane = start_plane(config, ServerOptions::default()).await;
    let agent = start_agent(agent_settings(&plane, "agent-a"), StaticExecutor::new(None));

    create_session(&plane, "s1", Some("agent-a")).await;
    dispatch(&plane, "s1", "start").await;

    let sessions = plane.state.sessions.clone();
    assert!(
        wait_until(Duration::from_secs(6), || {
            sessions.get("s1").is_some_and(|s| s.state == SessionState::Hibernated)
        })
        .await
    );

    // Staying idle must not produce a second hibernate.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let hibernates = agent
        .executor
        .executed()
        .iter()
        .filter(|c| c.command_type == CommandType::Hibernate)
        .count();
    assert_eq!(hibernates, 1);

    agent.stop().await;
    plane.stop().await;
}

#[tokio::test]
async fn touched_session_stays_running() {
    let mut config = fast_config("cp-1");
    config.idle.threshold_secs = 2;
    config.idle.sweep_interval_secs = 1;
    let plane = start_plane(config, ServerOptions::default()).await;
    let agent = start_agent(agent_settings(&plane, "agent-a"), StaticExecutor::new(None));

    create_session(&plane, "s1", Some("agent-a")).await;
    dispatch(&plane, "s1", "start").await;
    let sessions = plane.state.sessions.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            sessions.get("s1").is_some_and(|s| s.state == SessionState::Running)
        })
        .await
    );

    let client = reqwest::Client::new();
    for _ in 0..6 {
        let resp = client.post(plane.url("/sessions/s1/touch")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(sessions.get("s1").unwrap().state, SessionState::Running);

    agent.stop().await;
    plane.stop().await;
}
