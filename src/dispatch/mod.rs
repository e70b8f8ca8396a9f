//! Command dispatcher: durable, retried, per-session-ordered delivery of
//! commands to agents.
//!
//! A command is only attempted once every earlier command of its session is
//! terminal. The head command is claimed (`dispatched`) under the state lock
//! before any network I/O, so no command is ever in flight twice.

pub mod journal;

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::{self, SharedClock};
use crate::hub::{AckReceiver, RouteError};
use crate::protocol::{AckStatus, AgentCommand, CommandAck, CommandType, Platform};
use crate::session::{SessionState, SessionStore, StoreError, TransitionError};

pub use journal::{Journal, JournalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Dispatched,
    Acked,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Acked | CommandStatus::Failed | CommandStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub session_id: String,
    pub agent_id: Option<String>,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub ack_deadline: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

impl Command {
    fn frame(&self) -> AgentCommand {
        AgentCommand {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            command_type: self.command_type,
            payload: self.payload.clone(),
        }
    }
}

/// Session transitions driven by a command type.
struct Effects {
    on_dispatch: Option<SessionState>,
    on_deliver: Option<SessionState>,
    on_ack: SessionState,
}

fn effects(command_type: CommandType) -> Effects {
    match command_type {
        CommandType::Start => Effects {
            on_dispatch: None,
            on_deliver: Some(SessionState::Scheduling),
            on_ack: SessionState::Running,
        },
        CommandType::Hibernate => Effects {
            on_dispatch: Some(SessionState::Hibernating),
            on_deliver: None,
            on_ack: SessionState::Hibernated,
        },
        CommandType::Wake => Effects {
            on_dispatch: Some(SessionState::Waking),
            on_deliver: None,
            on_ack: SessionState::Running,
        },
        CommandType::Stop => Effects {
            on_dispatch: Some(SessionState::Stopping),
            on_deliver: None,
            on_ack: SessionState::Stopped,
        },
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Fractional jitter applied to every delay (0.2 = ±20%).
    pub jitter: f64,
    pub max_attempts: u32,
    pub max_total_wait: Duration,
    pub ack_timeout: Duration,
    pub scan_interval: Duration,
    pub scan_batch: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter: 0.2,
            max_attempts: 10,
            max_total_wait: Duration::from_secs(600),
            ack_timeout: Duration::from_secs(30),
            scan_interval: Duration::from_secs(1),
            scan_batch: 256,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed attempt, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff)
    }

    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is draining; not accepting commands")]
    Draining,
    #[error(transparent)]
    Session(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// How the dispatcher reaches agents. Implemented by the hub.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    /// Deliver `command` to the agent's live connection. `NotConnected` and
    /// peer failures are transient: the dispatcher retries later.
    async fn route(&self, agent_id: &str, command: AgentCommand) -> Result<AckReceiver, RouteError>;

    /// Pick an agent for a session that has none yet.
    fn schedule(&self, platform: Option<Platform>) -> Option<String>;

    /// The dispatcher stopped waiting for this command's ack.
    fn forget(&self, _command_id: &str) {}
}

#[derive(Default)]
struct DispatchState {
    commands: HashMap<String, Command>,
    queues: HashMap<String, VecDeque<String>>,
}

struct Attempt {
    command_id: String,
    session_id: String,
    agent_id: String,
    command_type: CommandType,
    attempt: u32,
    frame: AgentCommand,
    /// The agent was chosen by the scheduler for this attempt.
    scheduled: bool,
}

enum Step {
    Idle,
    Attempt(Attempt),
    Expired(Command),
    /// The command's session is not known to this process.
    Orphaned(Command),
}

struct DispatcherInner {
    state: Mutex<DispatchState>,
    sessions: SessionStore,
    router: Arc<dyn CommandRouter>,
    clock: SharedClock,
    policy: RetryPolicy,
    journal: Option<Journal>,
    draining: AtomicBool,
    landed: Notify,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        sessions: SessionStore,
        router: Arc<dyn CommandRouter>,
        clock: SharedClock,
        policy: RetryPolicy,
    ) -> Self {
        Self::build(sessions, router, clock, policy, None, DispatchState::default())
    }

    /// Like [`Dispatcher::new`], but every command state change is journaled
    /// to `path` and the journal is replayed first. Replayed commands that
    /// had not terminated go back to `pending`.
    pub fn with_journal(
        sessions: SessionStore,
        router: Arc<dyn CommandRouter>,
        clock: SharedClock,
        policy: RetryPolicy,
        path: impl AsRef<Path>,
    ) -> Result<Self, JournalError> {
        let (journal, replayed) = Journal::open(path)?;
        let now = clock.now();
        let mut state = DispatchState::default();
        let mut restored = 0usize;
        let mut replayed = replayed;
        replayed.sort_by_key(|c| c.created_at);
        for mut command in replayed {
            if !command.status.is_terminal() {
                command.status = CommandStatus::Pending;
                command.ack_deadline = None;
                command.next_attempt_at = now;
                state
                    .queues
                    .entry(command.session_id.clone())
                    .or_default()
                    .push_back(command.id.clone());
                restored += 1;
            }
            state.commands.insert(command.id.clone(), command);
        }
        if restored > 0 {
            tracing::info!(commands = restored, "restored unfinished commands from journal");
        }
        Ok(Self::build(sessions, router, clock, policy, Some(journal), state))
    }

    fn build(
        sessions: SessionStore,
        router: Arc<dyn CommandRouter>,
        clock: SharedClock,
        policy: RetryPolicy,
        journal: Option<Journal>,
        state: DispatchState,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(state),
                sessions,
                router,
                clock,
                policy,
                journal,
                draining: AtomicBool::new(false),
                landed: Notify::new(),
            }),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    fn record(&self, command: &Command) {
        if let Some(journal) = &self.inner.journal {
            if let Err(e) = journal.append(command) {
                tracing::error!(command = %command.id, error = %e, "failed to journal command");
            }
        }
    }

    /// Persist a command `pending`, queue it behind the session's earlier
    /// commands and try to deliver it right away.
    pub async fn dispatch(
        &self,
        session_id: &str,
        command_type: CommandType,
        payload: serde_json::Value,
    ) -> Result<String, DispatchError> {
        if self.inner.draining.load(Ordering::Acquire) {
            return Err(DispatchError::Draining);
        }
        let session = self
            .inner
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let effects = effects(command_type);
        match effects.on_dispatch {
            Some(to) => {
                self.inner.sessions.transition(
                    session_id,
                    to,
                    Some(format!("{command_type} requested")),
                )?;
            }
            None => {
                if let Some(to) = effects.on_deliver {
                    if !session.state.can_transition_to(to) {
                        return Err(TransitionError {
                            session: session_id.to_string(),
                            from: session.state,
                            to,
                        }
                        .into());
                    }
                }
            }
        }

        let now = self.inner.clock.now();
        let command = Command {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            agent_id: session.agent_id.clone(),
            command_type,
            payload,
            status: CommandStatus::Pending,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: clock::add(now, self.inner.policy.max_total_wait),
            next_attempt_at: now,
            ack_deadline: None,
            detail: None,
        };
        let id = command.id.clone();
        {
            let mut st = self.inner.state.lock();
            self.record(&command);
            st.queues
                .entry(session_id.to_string())
                .or_default()
                .push_back(id.clone());
            st.commands.insert(id.clone(), command);
        }
        tracing::info!(command = %id, session = %session_id, kind = %command_type, "command queued");

        self.pump(session_id).await;
        Ok(id)
    }

    pub fn get_command(&self, command_id: &str) -> Option<Command> {
        self.inner.state.lock().commands.get(command_id).cloned()
    }

    /// Every command of a session, oldest first, terminal ones included.
    pub fn list_commands(&self, session_id: &str) -> Vec<Command> {
        let mut commands: Vec<Command> = self
            .inner
            .state
            .lock()
            .commands
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.created_at);
        commands
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .state
            .lock()
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::Dispatched)
            .count()
    }

    /// Advance a session's queue as far as it can go right now.
    async fn pump(&self, session_id: &str) {
        loop {
            match self.next_step(session_id) {
                Step::Idle => return,
                Step::Expired(command) => {
                    tracing::warn!(
                        command = %command.id,
                        session = %command.session_id,
                        attempts = command.attempt_count,
                        "command expired"
                    );
                    self.inner.router.forget(&command.id);
                    self.apply(&command.session_id, SessionState::Failed, "command timeout".into());
                    self.inner.landed.notify_waiters();
                }
                Step::Orphaned(command) => {
                    tracing::warn!(
                        command = %command.id,
                        session = %command.session_id,
                        "session unknown; command failed without delivery"
                    );
                    self.inner.landed.notify_waiters();
                }
                Step::Attempt(attempt) => {
                    self.attempt(attempt).await;
                    return;
                }
            }
        }
    }

    fn next_step(&self, session_id: &str) -> Step {
        let now = self.inner.clock.now();
        let policy = &self.inner.policy;
        let mut st = self.inner.state.lock();
        let DispatchState { commands, queues } = &mut *st;

        let Some(queue) = queues.get_mut(session_id) else {
            return Step::Idle;
        };
        while let Some(head) = queue.front() {
            match commands.get(head) {
                Some(c) if !c.status.is_terminal() => break,
                _ => {
                    queue.pop_front();
                }
            }
        }
        let Some(head_id) = queue.front().cloned() else {
            queues.remove(session_id);
            return Step::Idle;
        };
        let Some(cmd) = commands.get_mut(&head_id) else {
            return Step::Idle;
        };

        if cmd.status == CommandStatus::Dispatched {
            match cmd.ack_deadline {
                Some(deadline) if now >= deadline => {
                    tracing::warn!(command = %cmd.id, attempt = cmd.attempt_count, "no ack within timeout");
                    cmd.status = CommandStatus::Pending;
                    cmd.ack_deadline = None;
                    cmd.next_attempt_at = clock::add(now, policy.jittered(cmd.attempt_count));
                    cmd.updated_at = now;
                    self.record(cmd);
                    self.inner.router.forget(&cmd.id);
                    self.inner.landed.notify_waiters();
                }
                _ => return Step::Idle,
            }
        }

        let Some(session) = self.inner.sessions.get(session_id) else {
            // Journaled commands can outlive their session across a restart.
            cmd.status = CommandStatus::Failed;
            cmd.detail = Some("session unknown".into());
            cmd.updated_at = now;
            self.record(cmd);
            let orphaned = cmd.clone();
            queue.pop_front();
            return Step::Orphaned(orphaned);
        };

        if now >= cmd.expires_at || cmd.attempt_count >= policy.max_attempts {
            cmd.status = CommandStatus::Expired;
            cmd.detail = Some("command timeout".into());
            cmd.updated_at = now;
            self.record(cmd);
            let expired = cmd.clone();
            queue.pop_front();
            return Step::Expired(expired);
        }
        if now < cmd.next_attempt_at {
            return Step::Idle;
        }

        let bound = cmd.agent_id.clone().or_else(|| session.agent_id.clone());
        let (agent_id, scheduled) = match bound {
            Some(agent) => (agent, false),
            None => match self.inner.router.schedule(session.platform) {
                Some(agent) => (agent, true),
                None => {
                    cmd.attempt_count += 1;
                    cmd.next_attempt_at = clock::add(now, policy.jittered(cmd.attempt_count));
                    cmd.updated_at = now;
                    self.record(cmd);
                    tracing::debug!(command = %cmd.id, session = %session_id, "no agent available; will retry");
                    return Step::Idle;
                }
            },
        };

        cmd.attempt_count += 1;
        cmd.status = CommandStatus::Dispatched;
        cmd.agent_id = Some(agent_id.clone());
        cmd.ack_deadline = Some(clock::add(now, policy.ack_timeout));
        cmd.updated_at = now;
        self.record(cmd);
        Step::Attempt(Attempt {
            command_id: cmd.id.clone(),
            session_id: session_id.to_string(),
            agent_id,
            command_type: cmd.command_type,
            attempt: cmd.attempt_count,
            frame: cmd.frame(),
            scheduled,
        })
    }

    async fn attempt(&self, a: Attempt) {
        tracing::debug!(command = %a.command_id, agent = %a.agent_id, attempt = a.attempt, "delivering command");
        match self.inner.router.route(&a.agent_id, a.frame).await {
            Ok(ack_rx) => {
                tracing::info!(
                    command = %a.command_id,
                    session = %a.session_id,
                    agent = %a.agent_id,
                    attempt = a.attempt,
                    "command delivered"
                );
                if a.scheduled {
                    if let Err(e) = self.inner.sessions.assign_agent(&a.session_id, &a.agent_id) {
                        tracing::warn!(session = %a.session_id, error = %e, "could not assign agent");
                    }
                }
                if let Some(to) = effects(a.command_type).on_deliver {
                    self.apply(&a.session_id, to, format!("{} delivered", a.command_type));
                }
                self.watch_ack(a.command_id, a.attempt, ack_rx);
            }
            Err(e) => {
                tracing::debug!(command = %a.command_id, agent = %a.agent_id, error = %e, "delivery failed; will retry");
                self.retry_later(&a.command_id, a.attempt, a.scheduled);
            }
        }
    }

    /// Put a dispatched attempt back to `pending` with backoff, unless the
    /// command has moved on since.
    fn retry_later(&self, command_id: &str, attempt: u32, unschedule: bool) {
        let now = self.inner.clock.now();
        {
            let mut st = self.inner.state.lock();
            let Some(cmd) = st.commands.get_mut(command_id) else {
                return;
            };
            if cmd.status != CommandStatus::Dispatched || cmd.attempt_count != attempt {
                return;
            }
            cmd.status = CommandStatus::Pending;
            cmd.ack_deadline = None;
            cmd.next_attempt_at = clock::add(now, self.inner.policy.jittered(attempt));
            cmd.updated_at = now;
            if unschedule {
                cmd.agent_id = None;
            }
            self.record(cmd);
        }
        self.inner.landed.notify_waiters();
    }

    fn watch_ack(&self, command_id: String, attempt: u32, ack_rx: AckReceiver) {
        let this = self.clone();
        tokio::spawn(async move {
            match ack_rx.await {
                Ok(ack) => this.on_ack(ack).await,
                Err(_) => {
                    // Connection lost or the attempt was superseded.
                    this.retry_later(&command_id, attempt, false);
                }
            }
        });
    }

    /// Land an agent's ack. Only the first ack for a command counts.
    pub async fn on_ack(&self, ack: CommandAck) {
        let now = self.inner.clock.now();
        let landed = {
            let mut st = self.inner.state.lock();
            let Some(cmd) = st.commands.get_mut(&ack.id) else {
                tracing::debug!(command = %ack.id, "ack for unknown command");
                return;
            };
            if cmd.status.is_terminal() {
                tracing::debug!(command = %ack.id, "duplicate ack ignored");
                return;
            }
            cmd.status = match ack.status {
                AckStatus::Success => CommandStatus::Acked,
                AckStatus::Failure => CommandStatus::Failed,
            };
            cmd.detail = ack.detail.clone();
            cmd.ack_deadline = None;
            cmd.updated_at = now;
            self.record(cmd);
            (cmd.session_id.clone(), cmd.command_type)
        };
        let (session_id, command_type) = landed;

        match ack.status {
            AckStatus::Success => {
                tracing::info!(command = %ack.id, session = %session_id, kind = %command_type, "command acked");
                if command_type == CommandType::Start {
                    if let Some(handle) = ack.detail.clone() {
                        if let Err(e) = self.inner.sessions.set_workload_ref(&session_id, handle) {
                            tracing::warn!(session = %session_id, error = %e, "could not record workload ref");
                        }
                    }
                }
                self.apply(
                    &session_id,
                    effects(command_type).on_ack,
                    format!("{command_type} acked"),
                );
            }
            AckStatus::Failure => {
                let reason = ack
                    .detail
                    .unwrap_or_else(|| format!("agent failed to {command_type}"));
                tracing::warn!(command = %ack.id, session = %session_id, reason = %reason, "command failed on agent");
                self.apply(&session_id, SessionState::Failed, reason);
            }
        }

        self.inner.landed.notify_waiters();
        self.pump(&session_id).await;
    }

    /// Late transitions that the table no longer allows are logged, not applied.
    fn apply(&self, session_id: &str, to: SessionState, reason: String) {
        if let Err(e) = self.inner.sessions.transition(session_id, to, Some(reason)) {
            tracing::warn!(session = %session_id, error = %e, "ignoring session transition");
        }
    }

    /// One retry pass over a bounded batch of sessions whose head command is due.
    pub async fn scan(&self) -> usize {
        let now = self.inner.clock.now();
        let due: Vec<String> = {
            let st = self.inner.state.lock();
            st.queues
                .iter()
                .filter(|(_, q)| {
                    q.front()
                        .and_then(|id| st.commands.get(id))
                        .map_or(true, |c| is_due(c, now))
                })
                .map(|(session, _)| session.clone())
                .take(self.inner.policy.scan_batch)
                .collect()
        };
        for session_id in &due {
            self.pump(session_id).await;
        }
        due.len()
    }

    /// The periodic retry loop.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.inner.policy.scan_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    self.scan().await;
                }
            }
        }
    }

    /// An agent (re)connected: retry its waiting commands now instead of
    /// after their backoff.
    pub async fn agent_online(&self, agent_id: &str) {
        let now = self.inner.clock.now();
        let sessions: Vec<String> = {
            let mut st = self.inner.state.lock();
            let DispatchState { commands, queues } = &mut *st;
            queues
                .iter()
                .filter_map(|(session, q)| {
                    let cmd = commands.get_mut(q.front()?)?;
                    let waiting = cmd.status == CommandStatus::Pending
                        && cmd.agent_id.as_deref().map_or(true, |a| a == agent_id);
                    if waiting {
                        cmd.next_attempt_at = now;
                        Some(session.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        if !sessions.is_empty() {
            tracing::debug!(agent = %agent_id, sessions = sessions.len(), "redelivering after reconnect");
        }
        for session_id in &sessions {
            self.pump(session_id).await;
        }
    }

    /// Stop accepting commands and wait (bounded) for in-flight ones to land.
    /// Returns true if nothing was left in flight.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.inner.draining.store(true, Ordering::Release);
        tracing::info!(in_flight = self.in_flight(), "dispatcher draining");
        let settled = tokio::time::timeout(timeout, async {
            loop {
                let landed = self.inner.landed.notified();
                if self.in_flight() == 0 {
                    return;
                }
                landed.await;
            }
        })
        .await
        .is_ok();
        if !settled {
            tracing::warn!(in_flight = self.in_flight(), "drain timed out with commands in flight");
        }
        settled
    }
}

fn is_due(c: &Command, now: DateTime<Utc>) -> bool {
    match c.status {
        CommandStatus::Pending => now >= c.next_attempt_at || now >= c.expires_at,
        CommandStatus::Dispatched => c.ack_deadline.map_or(false, |d| now >= d),
        _ => true,
    }
}
