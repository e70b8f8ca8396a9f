//! Stream proxy: relays an opaque interactive byte stream between an
//! authenticated client and a tunnel the session's agent dials back.

pub mod relay;
pub mod token;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::hub::{Hub, HubError};
use crate::protocol::CommandType;
use crate::session::{SessionState, SessionStore};

pub use relay::{relay, Duplex, RelayEnd, RelayLimits, RelayReport};
pub use token::{StreamClaims, StreamTokenSigner, TokenError};

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub token_ttl: Duration,
    /// Minimum gap between activity touches caused by stream traffic.
    pub touch_interval: Duration,
    pub limits: RelayLimits,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(300),
            touch_interval: Duration::from_secs(15),
            limits: RelayLimits::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("stream token is for another session")]
    SessionMismatch,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session {0} is waking; retry shortly")]
    Waking(String),
    #[error("session {session} is {state}, not running")]
    NotRunning { session: String, state: SessionState },
    #[error("session {0} has no agent")]
    Unassigned(String),
    #[error(transparent)]
    Tunnel(#[from] HubError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// An authorized, not yet connected stream.
#[derive(Debug, Clone)]
pub struct StreamGrant {
    pub session_id: String,
    pub user_id: String,
    pub agent_id: String,
}

struct ActiveStream {
    session_id: String,
    agent_id: String,
    cancel: CancellationToken,
}

struct ProxyInner {
    signer: StreamTokenSigner,
    sessions: SessionStore,
    dispatcher: Dispatcher,
    hub: Hub,
    clock: SharedClock,
    settings: ProxySettings,
    active: Mutex<HashMap<u64, ActiveStream>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct StreamProxy {
    inner: Arc<ProxyInner>,
}

impl StreamProxy {
    pub fn new(
        signer: StreamTokenSigner,
        sessions: SessionStore,
        dispatcher: Dispatcher,
        hub: Hub,
        clock: SharedClock,
        settings: ProxySettings,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                signer,
                sessions,
                dispatcher,
                hub,
                clock,
                settings,
                active: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        self.inner.settings.token_ttl
    }

    pub fn issue_token(&self, session_id: &str, user_id: &str) -> Result<String, ProxyError> {
        if self.inner.sessions.get(session_id).is_none() {
            return Err(ProxyError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.inner.signer.issue(
            session_id,
            user_id,
            self.inner.settings.token_ttl,
            self.inner.clock.now(),
        )?)
    }

    /// Validate the token and the session before any tunnel is requested.
    /// A hibernated session is woken and the stream refused until it runs.
    pub async fn authorize(&self, session_id: &str, token: &str) -> Result<StreamGrant, ProxyError> {
        let claims = self.inner.signer.verify(token, self.inner.clock.now())?;
        if claims.sid != session_id {
            return Err(ProxyError::SessionMismatch);
        }
        let session = self
            .inner
            .sessions
            .get(session_id)
            .ok_or_else(|| ProxyError::SessionNotFound(session_id.to_string()))?;
        match session.state {
            SessionState::Running => {}
            SessionState::Hibernated => {
                let command = self
                    .inner
                    .dispatcher
                    .dispatch(session_id, CommandType::Wake, serde_json::Value::Null)
                    .await?;
                tracing::info!(session = %session_id, command = %command, "stream opened on hibernated session; waking");
                return Err(ProxyError::Waking(session_id.to_string()));
            }
            SessionState::Waking => return Err(ProxyError::Waking(session_id.to_string())),
            state => {
                return Err(ProxyError::NotRunning {
                    session: session_id.to_string(),
                    state,
                })
            }
        }
        let agent_id = session
            .agent_id
            .ok_or_else(|| ProxyError::Unassigned(session_id.to_string()))?;
        Ok(StreamGrant {
            session_id: session.id,
            user_id: claims.uid,
            agent_id,
        })
    }

    pub async fn open_tunnel(&self, grant: &StreamGrant) -> Result<Duplex, ProxyError> {
        Ok(self
            .inner
            .hub
            .open_tunnel(&grant.agent_id, &grant.session_id)
            .await?)
    }

    /// Relay an authorized client against an established tunnel.
    pub async fn run(&self, grant: StreamGrant, client: Duplex, agent: Duplex) -> RelayReport {
        let stream_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        self.inner.active.lock().insert(
            stream_id,
            ActiveStream {
                session_id: grant.session_id.clone(),
                agent_id: grant.agent_id.clone(),
                cancel: cancel.clone(),
            },
        );
        tracing::info!(session = %grant.session_id, user = %grant.user_id, agent = %grant.agent_id, "stream opened");

        let report = relay(
            client,
            agent,
            self.inner.settings.limits.clone(),
            cancel,
            self.activity_hook(&grant.session_id),
        )
        .await;

        self.inner.active.lock().remove(&stream_id);
        tracing::info!(
            session = %grant.session_id,
            end = ?report.end,
            client_to_agent = report.client_to_agent,
            agent_to_client = report.agent_to_client,
            "stream closed"
        );
        report
    }

    /// Authorize, open the tunnel and relay until the stream ends.
    pub async fn open_stream(
        &self,
        session_id: &str,
        token: &str,
        client: Duplex,
    ) -> Result<RelayReport, ProxyError> {
        let grant = self.authorize(session_id, token).await?;
        let agent = self.open_tunnel(&grant).await?;
        Ok(self.run(grant, client, agent).await)
    }

    /// Throttled activity touches for one stream.
    fn activity_hook(&self, session_id: &str) -> Arc<dyn Fn() + Send + Sync> {
        let sessions = self.inner.sessions.clone();
        let session_id = session_id.to_string();
        let started = Instant::now();
        let gap = self.inner.settings.touch_interval.as_millis() as u64;
        let last = AtomicU64::new(u64::MAX);
        Arc::new(move || {
            let now = started.elapsed().as_millis() as u64;
            let prev = last.load(Ordering::Relaxed);
            if prev != u64::MAX && now.saturating_sub(prev) < gap {
                return;
            }
            if last
                .compare_exchange(prev, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let _ = sessions.touch(&session_id);
            }
        })
    }

    pub fn active_streams(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn cancel_agent_streams(&self, agent_id: &str) -> usize {
        self.cancel_where(|s| s.agent_id == agent_id)
    }

    pub fn cancel_session_streams(&self, session_id: &str) -> usize {
        self.cancel_where(|s| s.session_id == session_id)
    }

    fn cancel_where(&self, pred: impl Fn(&ActiveStream) -> bool) -> usize {
        let active = self.inner.active.lock();
        let mut n = 0;
        for stream in active.values().filter(|s| pred(s)) {
            stream.cancel.cancel();
            n += 1;
        }
        n
    }

    /// Cancel every stream. Used at shutdown.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatch::RetryPolicy;
    use crate::hub::{AgentAuth, HubSettings, InMemoryRoutingTable, NoPeers};
    use crate::session::NewSession;

    fn proxy(clock: &ManualClock) -> (StreamProxy, SessionStore) {
        let shared: SharedClock = Arc::new(clock.clone());
        let sessions = SessionStore::new(shared.clone());
        let hub = Hub::new(
            HubSettings::default(),
            AgentAuth::fleet("t"),
            Arc::new(InMemoryRoutingTable::new()),
            Arc::new(NoPeers),
            shared.clone(),
        );
        let dispatcher = Dispatcher::new(
            sessions.clone(),
            Arc::new(hub.clone()),
            shared.clone(),
            RetryPolicy::default(),
        );
        let proxy = StreamProxy::new(
            StreamTokenSigner::new("k"),
            sessions.clone(),
            dispatcher,
            hub,
            shared,
            ProxySettings::default(),
        );
        (proxy, sessions)
    }

    fn session_in(sessions: &SessionStore, id: &str, path: &[SessionState]) {
        sessions
            .create(NewSession {
                id: Some(id.into()),
                owner_id: "u".into(),
                agent_id: Some("agent-a".into()),
                ..Default::default()
            })
            .unwrap();
        for state in path {
            sessions.transition(id, *state, None).unwrap();
        }
    }

    #[tokio::test]
    async fn running_session_is_authorized() {
        let clock = ManualClock::starting_now();
        let (proxy, sessions) = proxy(&clock);
        session_in(&sessions, "s1", &[SessionState::Scheduling, SessionState::Running]);

        let token = proxy.issue_token("s1", "u").unwrap();
        let grant = proxy.authorize("s1", &token).await.unwrap();
        assert_eq!(grant.agent_id, "agent-a");
        assert_eq!(grant.user_id, "u");
    }

    #[tokio::test]
    async fn token_for_other_session_is_rejected() {
        let clock = ManualClock::starting_now();
        let (proxy, sessions) = proxy(&clock);
        session_in(&sessions, "s1", &[SessionState::Scheduling, SessionState::Running]);
        session_in(&sessions, "s2", &[SessionState::Scheduling, SessionState::Running]);

        let token = proxy.issue_token("s1", "u").unwrap();
        assert!(matches!(proxy.authorize("s2", &token).await, Err(ProxyError::SessionMismatch)));
    }

    #[tokio::test]
    async fn expired_token_is_rejected_before_tunnel() {
        let clock = ManualClock::starting_now();
        let (proxy, sessions) = proxy(&clock);
        session_in(&sessions, "s1", &[SessionState::Scheduling, SessionState::Running]);

        let token = proxy.issue_token("s1", "u").unwrap();
        clock.advance(Duration::from_secs(301));
        assert!(matches!(
            proxy.authorize("s1", &token).await,
            Err(ProxyError::Token(TokenError::Expired))
        ));
    }

    #[tokio::test]
    async fn hibernated_session_is_woken() {
        let clock = ManualClock::starting_now();
        let (proxy, sessions) = proxy(&clock);
        session_in(
            &sessions,
            "s1",
            &[
                SessionState::Scheduling,
                SessionState::Running,
                SessionState::Hibernating,
                SessionState::Hibernated,
            ],
        );

        let token = proxy.issue_token("s1", "u").unwrap();
        assert!(matches!(proxy.authorize("s1", &token).await, Err(ProxyError::Waking(_))));
        assert_eq!(sessions.get("s1").unwrap().state, SessionState::Waking);
        assert!(matches!(proxy.authorize("s1", &token).await, Err(ProxyError::Waking(_))));
    }

    #[tokio::test]
    async fn stopped_session_is_not_streamable() {
        let clock = ManualClock::starting_now();
        let (proxy, sessions) = proxy(&clock);
        session_in(&sessions, "s1", &[SessionState::Stopping, SessionState::Stopped]);

        let token = proxy.issue_token("s1", "u").unwrap();
        assert!(matches!(
            proxy.authorize("s1", &token).await,
            Err(ProxyError::NotRunning { state: SessionState::Stopped, .. })
        ));
    }

    #[tokio::test]
    async fn cancelling_agent_streams_ends_relay() {
        use futures::channel::mpsc;
        use futures::SinkExt;

        let clock = ManualClock::starting_now();
        let (proxy, _sessions) = proxy(&clock);

        let (client_tx, client_rx) = mpsc::channel::<bytes::Bytes>(4);
        let (agent_tx, agent_rx) = mpsc::channel::<bytes::Bytes>(4);
        let (out_tx, _out_rx) = mpsc::channel::<bytes::Bytes>(4);
        let (back_tx, _back_rx) = mpsc::channel::<bytes::Bytes>(4);
        let client = Duplex::new(client_rx, out_tx.sink_map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)));
        let agent = Duplex::new(agent_rx, back_tx.sink_map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)));

        let grant = StreamGrant {
            session_id: "s1".into(),
            user_id: "u".into(),
            agent_id: "agent-a".into(),
        };
        let running = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.run(grant, client, agent).await })
        };
        while proxy.active_streams() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(proxy.cancel_agent_streams("agent-b"), 0);
        assert_eq!(proxy.cancel_agent_streams("agent-a"), 1);

        let report = running.await.unwrap();
        assert_eq!(report.end, RelayEnd::Cancelled);
        assert_eq!(proxy.active_streams(), 0);
        drop((client_tx, agent_tx));
    }
}
