use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{AgentConnection, Hub, Registration};
use crate::protocol::{AgentMessage, ServerMessage};

type WsSink = SplitSink<WebSocket, Message>;

/// Drive one agent socket from handshake to teardown.
///
/// - The first frame must be `register`, within the handshake timeout
/// - Then a select! loop: outbound frames from the hub, inbound agent frames,
///   hub-side cancellation (stale socket / missed heartbeats), shutdown
/// - A malformed frame drops this connection only
pub async fn serve_agent(socket: WebSocket, hub: Hub, shutdown: CancellationToken) {
    let (mut sink, mut stream) = socket.split();

    let first = tokio::time::timeout(hub.settings().handshake_timeout, stream.next()).await;
    let registration = match first {
        Ok(Some(Ok(Message::Text(text)))) => match AgentMessage::decode(text.as_str()) {
            Ok(AgentMessage::Register {
                agent_id,
                auth_token,
                platform,
                capabilities,
                capacity,
                heartbeat_interval_secs,
            }) => Registration {
                agent_id,
                auth_token,
                platform,
                capabilities,
                capacity,
                heartbeat_interval_secs,
            },
            Ok(_) => {
                reject(&mut sink, "first frame must be register").await;
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed register frame");
                reject(&mut sink, "malformed register frame").await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            reject(&mut sink, "first frame must be a text register frame").await;
            return;
        }
        Ok(_) => {
            tracing::debug!("agent socket closed before registering");
            return;
        }
        Err(_) => {
            tracing::debug!("agent did not register in time");
            reject(&mut sink, "registration timeout").await;
            return;
        }
    };

    let agent_id = registration.agent_id.clone();
    let mut conn = match hub.register(registration).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(agent = %agent_id, error = %e, "agent registration rejected");
            reject(&mut sink, &e.to_string()).await;
            return;
        }
    };

    let registered = ServerMessage::Registered {
        agent_id: agent_id.clone(),
        heartbeat_interval_secs: conn.heartbeat_interval.as_secs(),
    };
    let reason = if sink.send(Message::Text(registered.encode().into())).await.is_err() {
        "socket closed"
    } else {
        run_connection(&hub, &mut conn, &mut sink, &mut stream, &shutdown).await
    };

    hub.disconnect(&agent_id, &conn.connection_id, reason).await;
    let _ = sink.send(Message::Close(None)).await;
}

async fn run_connection(
    hub: &Hub,
    conn: &mut AgentConnection,
    sink: &mut WsSink,
    stream: &mut futures::stream::SplitStream<WebSocket>,
    shutdown: &CancellationToken,
) -> &'static str {
    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => return "stale connection",
            _ = shutdown.cancelled() => return "control plane shutting down",
            out = conn.outbound.recv() => {
                let Some(frame) = out else { return "hub released connection" };
                if sink.send(Message::Text(frame.encode().into())).await.is_err() {
                    return "write failed";
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match AgentMessage::decode(text.as_str()) {
                        Ok(frame) => {
                            if let Err(reason) = handle_frame(hub, conn, frame).await {
                                tracing::warn!(agent = %conn.agent_id, reason, "protocol violation; dropping connection");
                                return reason;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(agent = %conn.agent_id, error = %e, "malformed frame; dropping connection");
                            return "malformed frame";
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!(agent = %conn.agent_id, "unexpected binary frame; dropping connection");
                        return "malformed frame";
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return "socket closed",
                    Some(Err(e)) => {
                        tracing::debug!(agent = %conn.agent_id, error = %e, "agent socket error");
                        return "socket error";
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    hub: &Hub,
    conn: &AgentConnection,
    frame: AgentMessage,
) -> Result<(), &'static str> {
    match frame {
        AgentMessage::Heartbeat { agent_id } => {
            if agent_id != conn.agent_id {
                return Err("heartbeat for another agent");
            }
            hub.heartbeat(&conn.agent_id, &conn.connection_id).await;
        }
        AgentMessage::CommandAck(ack) => {
            tracing::debug!(agent = %conn.agent_id, command = %ack.id, status = ?ack.status, "command ack");
            hub.resolve_ack(ack);
        }
        AgentMessage::TunnelReady { tunnel_id, endpoint } => {
            tracing::debug!(agent = %conn.agent_id, tunnel = %tunnel_id, endpoint = %endpoint, "tunnel ready");
        }
        AgentMessage::TunnelError { tunnel_id, reason } => {
            hub.tunnel_failed(&tunnel_id, reason);
        }
        AgentMessage::Draining { agent_id } => {
            if agent_id != conn.agent_id {
                return Err("draining notice for another agent");
            }
            hub.set_draining(&conn.agent_id, &conn.connection_id);
        }
        AgentMessage::Register { .. } => return Err("duplicate register"),
    }
    Ok(())
}

async fn reject(sink: &mut WsSink, reason: &str) {
    let frame = ServerMessage::Rejected {
        reason: reason.to_string(),
    };
    let _ = sink.send(Message::Text(frame.encode().into())).await;
    let _ = sink.send(Message::Close(None)).await;
}
