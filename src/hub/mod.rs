//! Connection hub: which agent is connected to which control-plane process.
//!
//! Each process keeps its own live links (one per agent socket it holds) and
//! an [`AgentDirectory`]. Ownership is published in the shared
//! [`RoutingTable`]; a delivery for an agent whose socket lives elsewhere is
//! handed to the owning process through a [`PeerForwarder`].

pub mod auth;
pub mod connection;
pub mod peers;
pub mod redis;
pub mod routing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::clock::{self, SharedClock};
use crate::protocol::{AgentCommand, CommandAck, Platform, ServerMessage, TunnelRequest};
use crate::proxy::relay::Duplex;

pub use auth::{AgentAuth, AuthError};
pub use peers::{ForwardedCommand, ForwardedTunnel, HttpPeers, LoopbackPeers, NoPeers, PeerForwarder};
pub use routing::{InMemoryRoutingTable, RouteClaim, RoutingError, RoutingTable};

/// Validate an agent id. Ids must be 1-128 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_agent_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("agent id must not be empty".into());
    }
    if id.len() > 128 {
        return Err(format!("agent id too long ({} chars, max 128)", id.len()));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!("agent id contains invalid characters: {id}"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Draining,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub platform: Platform,
    pub status: AgentStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub capacity: Option<u32>,
    pub capabilities: Vec<String>,
    pub heartbeat_interval_secs: u64,
    /// Owning process while online.
    pub process_id: Option<String>,
    #[serde(skip)]
    connection_id: Option<String>,
}

impl AgentRecord {
    /// An agent past its heartbeat window reads as offline even before the
    /// watchdog tears its socket down.
    fn observed(mut self, now: DateTime<Utc>, missed_heartbeats: u32) -> Self {
        let window = Duration::from_secs(self.heartbeat_interval_secs) * missed_heartbeats;
        if self.status != AgentStatus::Offline
            && clock::elapsed(self.last_heartbeat_at, now) > window
        {
            self.status = AgentStatus::Offline;
        }
        self
    }
}

/// Every agent this process has seen. Records are never deleted; a
/// reconnecting agent reuses its record.
#[derive(Clone)]
pub struct AgentDirectory {
    inner: Arc<RwLock<HashMap<String, AgentRecord>>>,
    clock: SharedClock,
    missed_heartbeats: u32,
}

impl AgentDirectory {
    pub fn new(clock: SharedClock, missed_heartbeats: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            clock,
            missed_heartbeats,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        let now = self.clock.now();
        self.inner
            .read()
            .get(agent_id)
            .cloned()
            .map(|r| r.observed(now, self.missed_heartbeats))
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        let now = self.clock.now();
        let mut agents: Vec<AgentRecord> = self
            .inner
            .read()
            .values()
            .cloned()
            .map(|r| r.observed(now, self.missed_heartbeats))
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Raw last heartbeat, used by the watchdog.
    fn last_heartbeat(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().get(agent_id).map(|r| r.last_heartbeat_at)
    }

    fn upsert_online(&self, record: AgentRecord) {
        self.inner.write().insert(record.id.clone(), record);
    }

    fn update_if_current<F: FnOnce(&mut AgentRecord)>(
        &self,
        agent_id: &str,
        connection_id: &str,
        f: F,
    ) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(agent_id) {
            Some(rec) if rec.connection_id.as_deref() == Some(connection_id) => {
                f(rec);
                true
            }
            _ => false,
        }
    }

    /// Choose an agent for an unscheduled session: online, matching the
    /// platform constraint, largest declared capacity first.
    pub fn pick(&self, platform: Option<Platform>) -> Option<String> {
        self.list()
            .into_iter()
            .filter(|r| r.status == AgentStatus::Online)
            .filter(|r| platform.map_or(true, |p| r.platform == p))
            .max_by(|a, b| {
                a.capacity
                    .unwrap_or(0)
                    .cmp(&b.capacity.unwrap_or(0))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|r| r.id)
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub process_id: String,
    /// Base URL (`http://host:port`) agents dial back to for tunnels.
    pub advertise_url: String,
    pub default_heartbeat_interval: Duration,
    /// Missed heartbeat intervals before an agent is declared offline.
    pub missed_heartbeats: u32,
    pub handshake_timeout: Duration,
    pub tunnel_timeout: Duration,
    /// How long a delivery may wait for room on an agent's outbound queue.
    pub delivery_timeout: Duration,
    pub outbound_buffer: usize,
    pub watchdog_interval: Duration,
    /// How long the owning process relays a forwarded command's ack before
    /// giving up on it.
    pub forwarded_ack_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            process_id: "fleetd".into(),
            advertise_url: "http://127.0.0.1:8080".into(),
            default_heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats: 3,
            handshake_timeout: Duration::from_secs(10),
            tunnel_timeout: Duration::from_secs(15),
            delivery_timeout: Duration::from_secs(5),
            outbound_buffer: 256,
            watchdog_interval: Duration::from_secs(1),
            forwarded_ack_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("agent {0} is not connected")]
    NotConnected(String),
    #[error("peer {peer} unreachable: {detail}")]
    PeerUnreachable { peer: String, detail: String },
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("unknown tunnel: {0}")]
    UnknownTunnel(String),
    #[error("tunnel {tunnel} failed: {reason}")]
    TunnelFailed { tunnel: String, reason: String },
    #[error("tunnel {0} was not established in time")]
    TunnelTimeout(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    AgentOnline { agent_id: String },
    AgentOffline { agent_id: String, reason: String },
}

/// What an agent sends when it registers.
#[derive(Debug, Clone)]
pub struct Registration {
    pub agent_id: String,
    pub auth_token: String,
    pub platform: Platform,
    pub capabilities: Vec<String>,
    pub capacity: Option<u32>,
    pub heartbeat_interval_secs: Option<u64>,
}

/// Handle for one registered agent socket, driven by [`connection::serve_agent`].
pub struct AgentConnection {
    pub agent_id: String,
    pub connection_id: String,
    pub heartbeat_interval: Duration,
    /// Frames the hub wants written to the socket.
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Cancelled when the hub considers this socket stale.
    pub cancel: CancellationToken,
}

pub type AckReceiver = oneshot::Receiver<CommandAck>;

#[derive(Clone)]
struct AgentLink {
    connection_id: String,
    heartbeat_interval: Duration,
    tx: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

/// The local socket a request went out on; `None` when a peer delivered it.
type Via = Option<String>;

struct AckWaiter {
    via: Via,
    tx: oneshot::Sender<CommandAck>,
}

struct PendingTunnel {
    agent_id: String,
    via: Via,
    tx: oneshot::Sender<Result<Duplex, String>>,
}

enum Owner {
    Local(RouteClaim),
    Peer(String),
    Nobody,
}

struct HubInner {
    settings: HubSettings,
    auth: AgentAuth,
    directory: AgentDirectory,
    routing: Arc<dyn RoutingTable>,
    peers: Arc<dyn PeerForwarder>,
    clock: SharedClock,
    links: RwLock<HashMap<String, AgentLink>>,
    ack_waiters: Mutex<HashMap<String, AckWaiter>>,
    tunnels: Mutex<HashMap<String, PendingTunnel>>,
    events_tx: broadcast::Sender<HubEvent>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(
        settings: HubSettings,
        auth: AgentAuth,
        routing: Arc<dyn RoutingTable>,
        peers: Arc<dyn PeerForwarder>,
        clock: SharedClock,
    ) -> Self {
        let directory = AgentDirectory::new(clock.clone(), settings.missed_heartbeats);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(HubInner {
                settings,
                auth,
                directory,
                routing,
                peers,
                clock,
                links: RwLock::new(HashMap::new()),
                ack_waiters: Mutex::new(HashMap::new()),
                tunnels: Mutex::new(HashMap::new()),
                events_tx,
            }),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.inner.settings.process_id
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.inner.directory
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn is_local(&self, agent_id: &str) -> bool {
        self.inner.links.read().contains_key(agent_id)
    }

    fn claim_ttl(&self, interval: Duration) -> Duration {
        interval * self.inner.settings.missed_heartbeats
    }

    fn claim(&self, connection_id: &str) -> RouteClaim {
        RouteClaim {
            process_id: self.inner.settings.process_id.clone(),
            connection_id: connection_id.to_string(),
        }
    }

    /// Authenticate an agent, publish ownership and record it online.
    pub async fn register(&self, reg: Registration) -> Result<AgentConnection, HubError> {
        validate_agent_id(&reg.agent_id).map_err(HubError::InvalidAgentId)?;
        self.inner.auth.verify(&reg.agent_id, &reg.auth_token)?;

        let interval = reg
            .heartbeat_interval_secs
            .map(|s| Duration::from_secs(s.clamp(1, 3600)))
            .unwrap_or(self.inner.settings.default_heartbeat_interval);
        let connection_id = uuid::Uuid::new_v4().to_string();
        let claim = self.claim(&connection_id);

        let outcome = routing::claim(
            self.inner.routing.as_ref(),
            &reg.agent_id,
            &claim,
            self.claim_ttl(interval),
        )
        .await?;
        if let Some(prev) = outcome.previous.filter(|p| p.process_id != claim.process_id) {
            tracing::info!(
                agent = %reg.agent_id,
                previous = %prev.process_id,
                "took over agent from peer process"
            );
        }

        let (tx, outbound) = mpsc::channel(self.inner.settings.outbound_buffer);
        let cancel = CancellationToken::new();
        let replaced = self.inner.links.write().insert(
            reg.agent_id.clone(),
            AgentLink {
                connection_id: connection_id.clone(),
                heartbeat_interval: interval,
                tx,
                cancel: cancel.clone(),
            },
        );
        if let Some(old) = replaced {
            tracing::info!(agent = %reg.agent_id, "replacing existing agent connection");
            old.cancel.cancel();
        }

        let now = self.inner.clock.now();
        self.inner.directory.upsert_online(AgentRecord {
            id: reg.agent_id.clone(),
            platform: reg.platform,
            status: AgentStatus::Online,
            last_heartbeat_at: now,
            connected_at: now,
            capacity: reg.capacity,
            capabilities: reg.capabilities,
            heartbeat_interval_secs: interval.as_secs(),
            process_id: Some(claim.process_id.clone()),
            connection_id: Some(connection_id.clone()),
        });
        tracing::info!(agent = %reg.agent_id, platform = %reg.platform, "agent registered");
        let _ = self.inner.events_tx.send(HubEvent::AgentOnline {
            agent_id: reg.agent_id.clone(),
        });

        Ok(AgentConnection {
            agent_id: reg.agent_id,
            connection_id,
            heartbeat_interval: interval,
            outbound,
            cancel,
        })
    }

    /// Record a heartbeat and keep the routing claim alive.
    pub async fn heartbeat(&self, agent_id: &str, connection_id: &str) {
        let now = self.inner.clock.now();
        let current = self
            .inner
            .directory
            .update_if_current(agent_id, connection_id, |rec| rec.last_heartbeat_at = now);
        if !current {
            return;
        }
        let Some(interval) = self
            .inner
            .links
            .read()
            .get(agent_id)
            .map(|l| l.heartbeat_interval)
        else {
            return;
        };
        let claim = self.claim(connection_id);
        match self
            .inner
            .routing
            .refresh(agent_id, &claim, self.claim_ttl(interval))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(agent = %agent_id, "routing claim lost; dropping stale socket");
                self.drop_link(agent_id, connection_id);
            }
            Err(e) => {
                tracing::warn!(agent = %agent_id, error = %e, "failed to refresh routing claim");
            }
        }
    }

    pub fn set_draining(&self, agent_id: &str, connection_id: &str) {
        if self
            .inner
            .directory
            .update_if_current(agent_id, connection_id, |rec| {
                rec.status = AgentStatus::Draining
            })
        {
            tracing::info!(agent = %agent_id, "agent draining");
        }
    }

    fn drop_link(&self, agent_id: &str, connection_id: &str) {
        if let Some(link) = self.inner.links.read().get(agent_id) {
            if link.connection_id == connection_id {
                link.cancel.cancel();
            }
        }
    }

    /// Tear down the hub side of a socket. Only the connection that currently
    /// holds the link may release the routing claim. Returns whether anything
    /// was torn down.
    pub async fn disconnect(&self, agent_id: &str, connection_id: &str, reason: &str) -> bool {
        let removed = {
            let mut links = self.inner.links.write();
            match links.get(agent_id) {
                Some(link) if link.connection_id == connection_id => links.remove(agent_id),
                _ => None,
            }
        };
        let Some(link) = removed else {
            return false;
        };
        link.cancel.cancel();

        let claim = self.claim(connection_id);
        if let Err(e) = self
            .inner
            .routing
            .compare_and_delete(agent_id, &claim)
            .await
        {
            tracing::warn!(agent = %agent_id, error = %e, "failed to release routing claim");
        }
        self.inner
            .directory
            .update_if_current(agent_id, connection_id, |rec| {
                rec.status = AgentStatus::Offline;
                rec.process_id = None;
            });
        let via = Some(connection_id.to_string());
        self.inner.ack_waiters.lock().retain(|_, w| w.via != via);
        self.inner.tunnels.lock().retain(|_, t| t.via != via);

        tracing::info!(agent = %agent_id, reason, "agent offline");
        let _ = self.inner.events_tx.send(HubEvent::AgentOffline {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    /// Declare agents offline whose last heartbeat is older than
    /// `missed_heartbeats` intervals. Returns the agents that timed out.
    pub async fn sweep_heartbeats(&self) -> Vec<String> {
        let now = self.inner.clock.now();
        let links: Vec<(String, String, Duration)> = self
            .inner
            .links
            .read()
            .iter()
            .map(|(agent, link)| (agent.clone(), link.connection_id.clone(), link.heartbeat_interval))
            .collect();

        let mut timed_out = Vec::new();
        for (agent, connection_id, interval) in links {
            let Some(last_heartbeat) = self.inner.directory.last_heartbeat(&agent) else {
                continue;
            };
            let silent = clock::elapsed(last_heartbeat, now);
            if silent > self.claim_ttl(interval) {
                tracing::warn!(
                    agent = %agent,
                    silent_secs = silent.as_secs(),
                    "missed heartbeats; marking agent offline"
                );
                if self.disconnect(&agent, &connection_id, "heartbeat timeout").await {
                    timed_out.push(agent);
                }
            }
        }
        timed_out
    }

    /// Periodic heartbeat watchdog.
    pub async fn run_watchdog(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.inner.settings.watchdog_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    self.sweep_heartbeats().await;
                }
            }
        }
    }

    async fn resolve_owner(&self, agent_id: &str) -> Result<Owner, RouteError> {
        match self.inner.routing.owner(agent_id).await? {
            Some(claim) if claim.process_id == self.inner.settings.process_id => {
                Ok(Owner::Local(claim))
            }
            Some(claim) => {
                // A peer took the agent over; any socket we still hold is stale.
                let stale = self
                    .inner
                    .links
                    .read()
                    .get(agent_id)
                    .map(|l| l.connection_id.clone());
                if let Some(connection_id) = stale {
                    tracing::info!(
                        agent = %agent_id,
                        owner = %claim.process_id,
                        "agent owned by peer; dropping stale local socket"
                    );
                    self.drop_link(agent_id, &connection_id);
                }
                Ok(Owner::Peer(claim.process_id))
            }
            None => Ok(Owner::Nobody),
        }
    }

    async fn deliver_local(
        &self,
        agent_id: &str,
        claim: &RouteClaim,
        msg: ServerMessage,
    ) -> Result<(), RouteError> {
        let link = self.inner.links.read().get(agent_id).cloned();
        let Some(link) = link.filter(|l| l.connection_id == claim.connection_id) else {
            // The claim names this process but the socket is gone.
            let _ = self.inner.routing.compare_and_delete(agent_id, claim).await;
            return Err(RouteError::NotConnected(agent_id.to_string()));
        };
        match tokio::time::timeout(self.inner.settings.delivery_timeout, link.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                tracing::warn!(agent = %agent_id, "agent socket not accepting frames; dropping it");
                self.drop_link(agent_id, &link.connection_id);
                Err(RouteError::NotConnected(agent_id.to_string()))
            }
        }
    }

    /// Deliver a command to whichever process holds the agent's socket.
    /// The returned receiver resolves once with the agent's ack.
    pub async fn route_command(
        &self,
        agent_id: &str,
        command: AgentCommand,
    ) -> Result<AckReceiver, RouteError> {
        let command_id = command.id.clone();
        let (tx, rx) = oneshot::channel();

        let result = match self.resolve_owner(agent_id).await {
            Ok(Owner::Local(claim)) => {
                self.await_ack(&command_id, Some(claim.connection_id.clone()), tx);
                self.deliver_local(agent_id, &claim, ServerMessage::Command { command })
                    .await
            }
            Ok(Owner::Peer(peer)) => {
                self.await_ack(&command_id, None, tx);
                tracing::debug!(agent = %agent_id, peer = %peer, command = %command_id, "forwarding command to owner");
                self.inner
                    .peers
                    .forward_command(
                        &peer,
                        ForwardedCommand {
                            origin: self.inner.settings.process_id.clone(),
                            agent_id: agent_id.to_string(),
                            command,
                        },
                    )
                    .await
            }
            Ok(Owner::Nobody) => Err(RouteError::NotConnected(agent_id.to_string())),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(rx),
            Err(e) => {
                self.inner.ack_waiters.lock().remove(&command_id);
                Err(e)
            }
        }
    }

    /// A peer dispatched a command for an agent it believes we hold. The ack
    /// is relayed back to the origin process.
    pub async fn accept_forwarded_command(&self, fwd: ForwardedCommand) -> Result<(), RouteError> {
        let Owner::Local(claim) = self.resolve_owner(&fwd.agent_id).await? else {
            return Err(RouteError::NotConnected(fwd.agent_id));
        };
        let command_id = fwd.command.id.clone();
        let (tx, rx) = oneshot::channel();
        self.await_ack(&command_id, Some(claim.connection_id.clone()), tx);
        if let Err(e) = self
            .deliver_local(&fwd.agent_id, &claim, ServerMessage::Command { command: fwd.command })
            .await
        {
            self.inner.ack_waiters.lock().remove(&command_id);
            return Err(e);
        }

        let hub = self.clone();
        let origin = fwd.origin;
        tokio::spawn(async move {
            match tokio::time::timeout(hub.inner.settings.forwarded_ack_timeout, rx).await {
                Ok(Ok(ack)) => {
                    if let Err(e) = hub.inner.peers.forward_ack(&origin, ack).await {
                        tracing::warn!(origin = %origin, command = %command_id, error = %e, "failed to relay ack to origin");
                    }
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::debug!(origin = %origin, command = %command_id, "no ack to relay; giving up");
                    hub.cancel_ack(&command_id);
                }
            }
        });
        Ok(())
    }

    fn await_ack(&self, command_id: &str, via: Via, tx: oneshot::Sender<CommandAck>) {
        self.inner
            .ack_waiters
            .lock()
            .insert(command_id.to_string(), AckWaiter { via, tx });
    }

    /// Forget the ack waiter for a command the dispatcher no longer waits on.
    pub fn cancel_ack(&self, command_id: &str) {
        self.inner.ack_waiters.lock().remove(command_id);
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.ack_waiters.lock().len()
    }

    /// Hand an agent's ack to whoever waits for it. Each ack resolves at most once.
    pub fn resolve_ack(&self, ack: CommandAck) {
        let waiter = self.inner.ack_waiters.lock().remove(&ack.id);
        match waiter {
            Some(w) => {
                let _ = w.tx.send(ack);
            }
            None => {
                tracing::debug!(command = %ack.id, "ack with no waiter; dropping");
            }
        }
    }

    fn callback_url(&self, tunnel_id: &str) -> String {
        let base = self.inner.settings.advertise_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/agent/tunnel/{tunnel_id}")
    }

    /// Ask the agent to dial a tunnel back to this process for `session_id`
    /// and wait for it to arrive.
    pub async fn open_tunnel(&self, agent_id: &str, session_id: &str) -> Result<Duplex, HubError> {
        let tunnel_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let request = TunnelRequest {
            tunnel_id: tunnel_id.clone(),
            session_id: session_id.to_string(),
            callback_url: self.callback_url(&tunnel_id),
        };

        let sent = match self.resolve_owner(agent_id).await {
            Ok(Owner::Local(claim)) => {
                self.await_tunnel(&tunnel_id, agent_id, Some(claim.connection_id.clone()), tx);
                self.deliver_local(agent_id, &claim, ServerMessage::TunnelRequest(request))
                    .await
            }
            Ok(Owner::Peer(peer)) => {
                self.await_tunnel(&tunnel_id, agent_id, None, tx);
                self.inner
                    .peers
                    .forward_tunnel(
                        &peer,
                        ForwardedTunnel {
                            agent_id: agent_id.to_string(),
                            request,
                        },
                    )
                    .await
            }
            Ok(Owner::Nobody) => Err(RouteError::NotConnected(agent_id.to_string())),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.inner.tunnels.lock().remove(&tunnel_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.inner.settings.tunnel_timeout, rx).await {
            Ok(Ok(Ok(duplex))) => Ok(duplex),
            Ok(Ok(Err(reason))) => Err(HubError::TunnelFailed {
                tunnel: tunnel_id,
                reason,
            }),
            Ok(Err(_)) => Err(HubError::TunnelFailed {
                tunnel: tunnel_id,
                reason: "agent disconnected".into(),
            }),
            Err(_) => {
                self.inner.tunnels.lock().remove(&tunnel_id);
                Err(HubError::TunnelTimeout(tunnel_id))
            }
        }
    }

    fn await_tunnel(
        &self,
        tunnel_id: &str,
        agent_id: &str,
        via: Via,
        tx: oneshot::Sender<Result<Duplex, String>>,
    ) {
        self.inner.tunnels.lock().insert(
            tunnel_id.to_string(),
            PendingTunnel {
                agent_id: agent_id.to_string(),
                via,
                tx,
            },
        );
    }

    /// A peer holds a stream client and wants our agent to dial back to it.
    pub async fn accept_forwarded_tunnel(&self, fwd: ForwardedTunnel) -> Result<(), RouteError> {
        let Owner::Local(claim) = self.resolve_owner(&fwd.agent_id).await? else {
            return Err(RouteError::NotConnected(fwd.agent_id));
        };
        self.deliver_local(&fwd.agent_id, &claim, ServerMessage::TunnelRequest(fwd.request))
            .await
    }

    /// Check the dial-back credentials before the tunnel socket is upgraded.
    pub fn authorize_tunnel(&self, tunnel_id: &str, token: &str) -> Result<(), HubError> {
        let agent_id = self
            .inner
            .tunnels
            .lock()
            .get(tunnel_id)
            .map(|t| t.agent_id.clone())
            .ok_or_else(|| HubError::UnknownTunnel(tunnel_id.to_string()))?;
        self.inner.auth.verify(&agent_id, token)?;
        Ok(())
    }

    pub fn attach_tunnel(&self, tunnel_id: &str, duplex: Duplex) -> Result<(), HubError> {
        let pending = self
            .inner
            .tunnels
            .lock()
            .remove(tunnel_id)
            .ok_or_else(|| HubError::UnknownTunnel(tunnel_id.to_string()))?;
        pending
            .tx
            .send(Ok(duplex))
            .map_err(|_| HubError::UnknownTunnel(tunnel_id.to_string()))
    }

    pub fn tunnel_failed(&self, tunnel_id: &str, reason: String) {
        if let Some(pending) = self.inner.tunnels.lock().remove(tunnel_id) {
            tracing::warn!(tunnel = %tunnel_id, agent = %pending.agent_id, reason = %reason, "agent could not open tunnel");
            let _ = pending.tx.send(Err(reason));
        }
    }
}

#[async_trait::async_trait]
impl crate::dispatch::CommandRouter for Hub {
    async fn route(&self, agent_id: &str, command: AgentCommand) -> Result<AckReceiver, RouteError> {
        self.route_command(agent_id, command).await
    }

    fn schedule(&self, platform: Option<Platform>) -> Option<String> {
        self.inner.directory.pick(platform)
    }

    fn forget(&self, command_id: &str) {
        self.cancel_ack(command_id);
    }
}
