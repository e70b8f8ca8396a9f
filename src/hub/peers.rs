//! Forwarding between control-plane processes.
//!
//! When an agent's socket lives on another process, the routing table names
//! that process and the delivery is handed over through a [`PeerForwarder`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{Hub, RouteError};
use crate::protocol::{AgentCommand, CommandAck, TunnelRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedCommand {
    /// Process that dispatched the command and waits for its ack.
    pub origin: String,
    pub agent_id: String,
    pub command: AgentCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedTunnel {
    pub agent_id: String,
    pub request: TunnelRequest,
}

#[async_trait]
pub trait PeerForwarder: Send + Sync {
    async fn forward_command(&self, peer: &str, fwd: ForwardedCommand) -> Result<(), RouteError>;
    async fn forward_ack(&self, peer: &str, ack: CommandAck) -> Result<(), RouteError>;
    async fn forward_tunnel(&self, peer: &str, fwd: ForwardedTunnel) -> Result<(), RouteError>;
}

/// Single-process deployments: nothing to forward to.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPeers;

#[async_trait]
impl PeerForwarder for NoPeers {
    async fn forward_command(&self, peer: &str, fwd: ForwardedCommand) -> Result<(), RouteError> {
        Err(RouteError::PeerUnreachable {
            peer: peer.to_string(),
            detail: format!("no peers configured (agent {})", fwd.agent_id),
        })
    }

    async fn forward_ack(&self, peer: &str, _ack: CommandAck) -> Result<(), RouteError> {
        Err(RouteError::PeerUnreachable {
            peer: peer.to_string(),
            detail: "no peers configured".into(),
        })
    }

    async fn forward_tunnel(&self, peer: &str, fwd: ForwardedTunnel) -> Result<(), RouteError> {
        Err(RouteError::PeerUnreachable {
            peer: peer.to_string(),
            detail: format!("no peers configured (agent {})", fwd.agent_id),
        })
    }
}

/// Shared connect and request timeouts for peer requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwards over the peers' `/internal/*` HTTP routes.
pub struct HttpPeers {
    /// process id -> base URL (`http://host:port`)
    peers: HashMap<String, String>,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpPeers {
    pub fn new(peers: HashMap<String, String>, token: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            peers,
            token,
            client,
        })
    }

    async fn post<T: Serialize + Sync>(&self, peer: &str, path: &str, body: &T) -> Result<(), RouteError> {
        let base = self.peers.get(peer).ok_or_else(|| RouteError::PeerUnreachable {
            peer: peer.to_string(),
            detail: "unknown peer".into(),
        })?;
        let url = format!("{}{}", base.trim_end_matches('/'), path);

        let mut req = self.client.post(&url).json(body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| RouteError::PeerUnreachable {
            peer: peer.to_string(),
            detail: e.to_string(),
        })?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT | StatusCode::NOT_FOUND => Err(RouteError::NotConnected(peer.to_string())),
            s => Err(RouteError::PeerUnreachable {
                peer: peer.to_string(),
                detail: format!("peer answered {s}"),
            }),
        }
    }
}

#[async_trait]
impl PeerForwarder for HttpPeers {
    async fn forward_command(&self, peer: &str, fwd: ForwardedCommand) -> Result<(), RouteError> {
        self.post(peer, "/internal/route", &fwd).await
    }

    async fn forward_ack(&self, peer: &str, ack: CommandAck) -> Result<(), RouteError> {
        self.post(peer, "/internal/ack", &ack).await
    }

    async fn forward_tunnel(&self, peer: &str, fwd: ForwardedTunnel) -> Result<(), RouteError> {
        self.post(peer, "/internal/tunnel", &fwd).await
    }
}

/// In-process forwarding between hubs living in the same binary.
#[derive(Clone, Default)]
pub struct LoopbackPeers {
    hubs: Arc<RwLock<HashMap<String, Hub>>>,
}

impl LoopbackPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hub: Hub) {
        self.hubs.write().insert(hub.process_id().to_string(), hub);
    }

    fn hub(&self, peer: &str) -> Result<Hub, RouteError> {
        self.hubs
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| RouteError::PeerUnreachable {
                peer: peer.to_string(),
                detail: "unknown peer".into(),
            })
    }
}

#[async_trait]
impl PeerForwarder for LoopbackPeers {
    async fn forward_command(&self, peer: &str, fwd: ForwardedCommand) -> Result<(), RouteError> {
        self.hub(peer)?.accept_forwarded_command(fwd).await
    }

    async fn forward_ack(&self, peer: &str, ack: CommandAck) -> Result<(), RouteError> {
        self.hub(peer)?.resolve_ack(ack);
        Ok(())
    }

    async fn forward_tunnel(&self, peer: &str, fwd: ForwardedTunnel) -> Result<(), RouteError> {
        self.hub(peer)?.accept_forwarded_tunnel(fwd).await
    }
}
