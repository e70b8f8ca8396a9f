use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::{self, SharedClock};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::protocol::CommandType;
use crate::session::{SessionState, SessionStore, StoreError};

#[derive(Debug, Clone)]
pub struct IdleSettings {
    /// Threshold for sessions without their own. `None` disables the default.
    pub default_threshold: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            default_threshold: Some(Duration::from_secs(30 * 60)),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Hibernates running sessions nobody has used for a while.
///
/// A crossing is identified by the `last_activity_at` value the session had
/// when the sweep fired for it, so a session that stays idle is hibernated
/// once, and any later activity starts a new crossing.
#[derive(Clone)]
pub struct IdleTracker {
    sessions: SessionStore,
    dispatcher: Dispatcher,
    clock: SharedClock,
    settings: IdleSettings,
    fired: std::sync::Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl IdleTracker {
    pub fn new(
        sessions: SessionStore,
        dispatcher: Dispatcher,
        clock: SharedClock,
        settings: IdleSettings,
    ) -> Self {
        Self {
            sessions,
            dispatcher,
            clock,
            settings,
            fired: Default::default(),
        }
    }

    pub fn touch(&self, session_id: &str) -> Result<DateTime<Utc>, StoreError> {
        self.sessions.touch(session_id)
    }

    /// Dispatch `hibernate` for every running session past its threshold.
    /// Returns the sessions hibernated by this sweep.
    pub async fn sweep(&self) -> Vec<String> {
        let now = self.clock.now();
        let running = self.sessions.in_state(SessionState::Running);
        {
            let mut fired = self.fired.lock();
            fired.retain(|id, _| running.iter().any(|s| &s.id == id));
        }

        let mut hibernated = Vec::new();
        for session in running {
            let Some(threshold) = session.idle_threshold(self.settings.default_threshold) else {
                continue;
            };
            let idle_for = clock::elapsed(session.last_activity_at, now);
            if idle_for < threshold {
                continue;
            }
            if self.fired.lock().get(&session.id) == Some(&session.last_activity_at) {
                continue;
            }

            let payload = serde_json::json!({ "reason": "idle", "idleSecs": idle_for.as_secs() });
            match self
                .dispatcher
                .dispatch(&session.id, CommandType::Hibernate, payload)
                .await
            {
                Ok(command_id) => {
                    tracing::info!(
                        session = %session.id,
                        idle_secs = idle_for.as_secs(),
                        command = %command_id,
                        "session idle; hibernating"
                    );
                    self.fired
                        .lock()
                        .insert(session.id.clone(), session.last_activity_at);
                    hibernated.push(session.id);
                }
                Err(DispatchError::Draining) => return hibernated,
                Err(e) => {
                    // Touched or moved on between the snapshot and the dispatch.
                    tracing::debug!(session = %session.id, error = %e, "idle hibernate skipped");
                }
            }
        }
        hibernated
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.settings.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}
