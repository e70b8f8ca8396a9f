use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::SharedClock;
use crate::protocol::Platform;

/// Validate a session id. Ids must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("session id must not be empty".into());
    }
    if id.len() > 64 {
        return Err(format!("session id too long ({} chars, max 64)", id.len()));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!(
            "session id contains invalid characters: {}",
            &id[..id.len().min(64)]
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Scheduling,
    Running,
    Hibernating,
    Hibernated,
    Waking,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// The transition table. Everything not listed here is rejected.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Requested, Scheduling)
            | (Scheduling, Running)
            | (Running, Hibernating)
            | (Hibernating, Running)
            | (Hibernating, Hibernated)
            | (Hibernated, Waking)
            | (Waking, Running)
            | (Stopping, Stopped) => true,
            (Stopping, Stopping) => false,
            (_, Stopping) | (_, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Requested => "requested",
            SessionState::Scheduling => "scheduling",
            SessionState::Running => "running",
            SessionState::Hibernating => "hibernating",
            SessionState::Hibernated => "hibernated",
            SessionState::Waking => "waking",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub agent_id: Option<String>,
    pub state: SessionState,
    pub last_activity_at: DateTime<Utc>,
    /// Per-session override of the idle threshold. `Some(0)` disables idle
    /// hibernation for this session.
    pub idle_threshold_secs: Option<u64>,
    pub workload_ref: Option<String>,
    pub platform: Option<Platform>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn idle_threshold(&self, default: Option<Duration>) -> Option<Duration> {
        match self.idle_threshold_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => default.filter(|d| !d.is_zero()),
        }
    }
}

/// Parameters for creating a session in `Requested`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSession {
    #[serde(default)]
    pub id: Option<String>,
    pub owner_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub idle_threshold_secs: Option<u64>,
}

/// Lifecycle events published by the [`SessionStore`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Created {
        session: String,
        owner: String,
    },
    StateChanged {
        session: String,
        from: SessionState,
        to: SessionState,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for session {session}: {from} -> {to}")]
pub struct TransitionError {
    pub session: String,
    pub from: SessionState,
    pub to: SessionState,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid session id: {0}")]
    InvalidId(String),
    #[error("session {session} is already assigned to agent {agent}")]
    AlreadyAssigned { session: String, agent: String },
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// The applied result of a transition.
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub from: SessionState,
    pub session: Session,
}

/// Authoritative session table.
///
/// Cheap to clone; all clones share the same table and event channel. The
/// lock is never held across an await point.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
    events_tx: broadcast::Sender<SessionEvent>,
    clock: SharedClock,
}

impl SessionStore {
    pub fn new(clock: SharedClock) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn create(&self, req: NewSession) -> Result<Session, StoreError> {
        let id = match req.id {
            Some(id) => {
                validate_session_id(&id).map_err(StoreError::InvalidId)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        let now = self.clock.now();
        let session = Session {
            id: id.clone(),
            owner_id: req.owner_id,
            agent_id: req.agent_id,
            state: SessionState::Requested,
            last_activity_at: now,
            idle_threshold_secs: req.idle_threshold_secs,
            workload_ref: None,
            platform: req.platform,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        {
            let mut inner = self.inner.write();
            if inner.contains_key(&id) {
                return Err(StoreError::AlreadyExists(id));
            }
            inner.insert(id.clone(), session.clone());
        }
        tracing::info!(session = %id, owner = %session.owner_id, "session created");
        let _ = self.events_tx.send(SessionEvent::Created {
            session: id,
            owner: session.owner_id.clone(),
        });
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.inner.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn in_state(&self, state: SessionState) -> Vec<Session> {
        self.inner
            .read()
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect()
    }

    /// Apply a transition if the table allows it.
    ///
    /// Entering `Running` resets the activity timestamp; entering `Failed`
    /// records `reason` as the failure reason.
    pub fn transition(
        &self,
        id: &str,
        to: SessionState,
        reason: Option<String>,
    ) -> Result<Transitioned, StoreError> {
        let now = self.clock.now();
        let applied = {
            let mut inner = self.inner.write();
            let session = inner
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let from = session.state;
            if !from.can_transition_to(to) {
                return Err(TransitionError {
                    session: id.to_string(),
                    from,
                    to,
                }
                .into());
            }
            session.state = to;
            session.updated_at = now;
            match to {
                SessionState::Running => session.last_activity_at = now,
                SessionState::Failed => session.failure_reason = reason.clone(),
                _ => {}
            }
            Transitioned {
                from,
                session: session.clone(),
            }
        };
        tracing::info!(
            session = %id,
            from = %applied.from,
            to = %to,
            reason = reason.as_deref().unwrap_or(""),
            "session transition"
        );
        let _ = self.events_tx.send(SessionEvent::StateChanged {
            session: id.to_string(),
            from: applied.from,
            to,
            reason,
            at: now,
        });
        Ok(applied)
    }

    /// Bind the session to an agent. A session keeps its agent for life.
    pub fn assign_agent(&self, id: &str, agent_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let session = inner
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        match &session.agent_id {
            Some(current) if current == agent_id => Ok(()),
            Some(current) => Err(StoreError::AlreadyAssigned {
                session: id.to_string(),
                agent: current.clone(),
            }),
            None => {
                session.agent_id = Some(agent_id.to_string());
                session.updated_at = self.clock.now();
                Ok(())
            }
        }
    }

    pub fn set_workload_ref(&self, id: &str, workload_ref: String) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let session = inner
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.workload_ref = Some(workload_ref);
        session.updated_at = self.clock.now();
        Ok(())
    }

    /// Record activity now. Last write wins.
    pub fn touch(&self, id: &str) -> Result<DateTime<Utc>, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let session = inner
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.last_activity_at = now;
        Ok(now)
    }

    pub fn sessions_for_agent(&self, agent_id: &str) -> Vec<String> {
        self.inner
            .read()
            .values()
            .filter(|s| s.agent_id.as_deref() == Some(agent_id))
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
