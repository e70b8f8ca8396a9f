//! Assembles one control-plane process from its configuration.
//!
//! [`ControlPlane::build`] wires the session store, hub, dispatcher, idle
//! tracker and stream proxy together; [`ControlPlane::serve`] runs the HTTP/WS
//! surface plus the periodic tasks until the shutdown signal fires, then
//! drains in-flight commands before closing sockets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState, RouterConfig};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{ConfigError, FleetConfig, RoutingBackend};
use crate::dispatch::journal::JournalError;
use crate::dispatch::Dispatcher;
use crate::hub::redis::RedisRoutingTable;
use crate::hub::{
    Hub, HubEvent, HttpPeers, InMemoryRoutingTable, NoPeers, PeerForwarder, RoutingError,
    RoutingTable,
};
use crate::idle::IdleTracker;
use crate::proxy::{StreamProxy, StreamTokenSigner};
use crate::session::{SessionEvent, SessionState, SessionStore};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("routing backend: {0}")]
    Routing(#[from] RoutingError),
    #[error("command journal: {0}")]
    Journal(#[from] JournalError),
    #[error("peer client: {0}")]
    Peers(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime inputs that do not come from the config file.
///
/// The routing table, peer forwarder and clock can be injected so several
/// processes can share them inside one test binary.
#[derive(Clone)]
pub struct ServerOptions {
    /// Base URL agents dial back to for tunnels.
    pub advertise_url: String,
    /// Overrides `server.api_token`.
    pub api_token: Option<String>,
    pub cors_origins: Vec<String>,
    pub drain_timeout: Duration,
    pub clock: SharedClock,
    pub routing: Option<Arc<dyn RoutingTable>>,
    pub peers: Option<Arc<dyn PeerForwarder>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            advertise_url: "http://127.0.0.1:8080".into(),
            api_token: None,
            cors_origins: Vec::new(),
            drain_timeout: Duration::from_secs(10),
            clock: Arc::new(SystemClock),
            routing: None,
            peers: None,
        }
    }
}

pub struct ControlPlane {
    state: AppState,
    router_config: RouterConfig,
    drain_timeout: Duration,
    background: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    pub async fn build(config: &FleetConfig, opts: ServerOptions) -> Result<Self, ServerError> {
        config.validate()?;
        let clock = opts.clock.clone();
        let process_id = config.process_id();

        let routing: Arc<dyn RoutingTable> = match (opts.routing, config.routing.backend) {
            (Some(routing), _) => routing,
            (None, RoutingBackend::Memory) => Arc::new(InMemoryRoutingTable::new()),
            (None, RoutingBackend::Redis) => {
                let url = config.routing.redis_url.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("routing.backend = \"redis\" requires routing.redis_url".into())
                })?;
                Arc::new(RedisRoutingTable::connect(url).await?)
            }
        };
        let peers: Arc<dyn PeerForwarder> = match opts.peers {
            Some(peers) => peers,
            None if config.peers.is_empty() => Arc::new(NoPeers),
            None => Arc::new(HttpPeers::new(
                config.peer_urls(),
                config.server.cluster_token.clone(),
            )?),
        };

        let sessions = SessionStore::new(clock.clone());
        let hub = Hub::new(
            config.hub_settings(process_id.clone(), opts.advertise_url.clone()),
            config.agent_auth(),
            routing,
            peers,
            clock.clone(),
        );
        let router = Arc::new(hub.clone());
        let dispatcher = match &config.server.journal {
            Some(path) => Dispatcher::with_journal(
                sessions.clone(),
                router,
                clock.clone(),
                config.retry_policy(),
                path,
            )?,
            None => Dispatcher::new(sessions.clone(), router, clock.clone(), config.retry_policy()),
        };
        let idle = IdleTracker::new(
            sessions.clone(),
            dispatcher.clone(),
            clock.clone(),
            config.idle_settings(),
        );

        let secret = match &config.server.stream_secret {
            Some(secret) => secret.clone(),
            None => {
                tracing::warn!(
                    "no server.stream_secret configured; stream tokens will not survive a restart \
                     or validate on peer processes"
                );
                random_secret()
            }
        };
        let proxy = StreamProxy::new(
            StreamTokenSigner::new(secret),
            sessions.clone(),
            dispatcher.clone(),
            hub.clone(),
            clock,
            config.proxy_settings(),
        );

        tracing::info!(process = %process_id, peers = config.peers.len(), "control plane assembled");

        Ok(Self {
            state: AppState {
                sessions,
                dispatcher,
                hub,
                idle,
                proxy,
                shutdown: CancellationToken::new(),
            },
            router_config: RouterConfig {
                api_token: opts.api_token.or_else(|| config.server.api_token.clone()),
                cluster_token: config.server.cluster_token.clone(),
                cors_origins: opts.cors_origins,
            },
            drain_timeout: opts.drain_timeout,
            background: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> axum::Router {
        api::router(self.state.clone(), self.router_config.clone())
    }

    /// Start the retry scan, idle sweep, heartbeat watchdog and the event
    /// bridge that reacts to agents coming and going.
    pub fn spawn_background(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        let s = &self.state;
        self.tasks.push(tokio::spawn(s.dispatcher.clone().run(self.background.child_token())));
        self.tasks.push(tokio::spawn(s.idle.clone().run(self.background.child_token())));
        self.tasks.push(tokio::spawn(s.hub.clone().run_watchdog(self.background.child_token())));
        self.tasks.push(tokio::spawn(bridge_hub_events(
            s.clone(),
            self.background.child_token(),
        )));
        self.tasks.push(tokio::spawn(bridge_session_events(
            s.clone(),
            self.background.child_token(),
        )));
    }

    /// Serve on `listener` until `signal` resolves, then shut down in order:
    /// stop accepting commands and let in-flight acks land, close agent and
    /// client sockets, stop the periodic tasks.
    pub async fn serve(
        mut self,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        self.spawn_background();
        let app = self.router();
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, process = %self.state.hub.process_id(), "HTTP/WS server listening");

        let state = self.state.clone();
        let drain_timeout = self.drain_timeout;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                tracing::info!("shutdown requested");
                state.dispatcher.drain(drain_timeout).await;
                state.proxy.shutdown();
                // Agent sockets and event feeds close on this.
                state.shutdown.cancel();
            })
            .await?;

        self.background.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(?e, "background task panicked");
            }
        }
        tracing::info!("control plane stopped");
        Ok(())
    }
}

async fn bridge_hub_events(state: AppState, cancel: CancellationToken) {
    let mut events = state.hub.subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            ev = events.recv() => ev,
        };
        match event {
            Ok(HubEvent::AgentOnline { agent_id }) => {
                state.dispatcher.agent_online(&agent_id).await;
            }
            Ok(HubEvent::AgentOffline { agent_id, reason }) => {
                let n = state.proxy.cancel_agent_streams(&agent_id);
                if n > 0 {
                    tracing::info!(agent = %agent_id, streams = n, reason = %reason, "closed streams of departed agent");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "hub event bridge lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn bridge_session_events(state: AppState, cancel: CancellationToken) {
    let mut events = state.sessions.subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            ev = events.recv() => ev,
        };
        match event {
            Ok(SessionEvent::StateChanged { session, to, .. })
                if matches!(
                    to,
                    SessionState::Stopping | SessionState::Stopped | SessionState::Failed
                ) =>
            {
                state.proxy.cancel_session_streams(&session);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "session event bridge lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn random_secret() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}
