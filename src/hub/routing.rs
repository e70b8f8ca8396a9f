//! The shared `agentId -> owning process` table.
//!
//! This is the only state shared between control-plane processes. It is only
//! ever mutated through compare-and-set and compare-and-delete so that two
//! processes racing for the same agent cannot both believe they own it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Ownership of one agent by one connection on one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteClaim {
    pub process_id: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// The claim this one replaced, if any.
    pub previous: Option<RouteClaim>,
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("routing store error: {0}")]
    Store(String),
    #[error("routing entry for {0} kept changing; giving up")]
    Contended(String),
    #[error("malformed routing entry: {0}")]
    Codec(String),
}

#[async_trait]
pub trait RoutingTable: Send + Sync {
    async fn owner(&self, agent_id: &str) -> Result<Option<RouteClaim>, RoutingError>;

    /// Write `claim` if the current entry equals `expected` (`None` = absent).
    async fn compare_and_set(
        &self,
        agent_id: &str,
        expected: Option<&RouteClaim>,
        claim: &RouteClaim,
        ttl: Duration,
    ) -> Result<bool, RoutingError>;

    /// Remove the entry only if it still equals `expected`.
    async fn compare_and_delete(
        &self,
        agent_id: &str,
        expected: &RouteClaim,
    ) -> Result<bool, RoutingError>;

    /// Extend the entry's lifetime. Returns false if the claim is no longer ours.
    async fn refresh(
        &self,
        agent_id: &str,
        claim: &RouteClaim,
        ttl: Duration,
    ) -> Result<bool, RoutingError>;
}

const MAX_CLAIM_ROUNDS: usize = 8;

/// Take ownership of `agent_id`. The newer claim always wins; the previous
/// holder is reported so the caller can treat that socket as stale.
pub async fn claim(
    table: &dyn RoutingTable,
    agent_id: &str,
    claim: &RouteClaim,
    ttl: Duration,
) -> Result<ClaimOutcome, RoutingError> {
    for _ in 0..MAX_CLAIM_ROUNDS {
        let current = table.owner(agent_id).await?;
        if table
            .compare_and_set(agent_id, current.as_ref(), claim, ttl)
            .await?
        {
            return Ok(ClaimOutcome { previous: current });
        }
        tracing::debug!(agent = %agent_id, "routing claim raced; retrying");
    }
    Err(RoutingError::Contended(agent_id.to_string()))
}

/// Process-local routing table. Several hubs may share one instance through
/// the `Arc`, which is how multi-process behaviour is tested in one binary.
///
/// Entries do not expire here; they are removed on disconnect.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRoutingTable {
    entries: Arc<Mutex<HashMap<String, RouteClaim>>>,
}

impl InMemoryRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl RoutingTable for InMemoryRoutingTable {
    async fn owner(&self, agent_id: &str) -> Result<Option<RouteClaim>, RoutingError> {
        Ok(self.entries.lock().get(agent_id).cloned())
    }

    async fn compare_and_set(
        &self,
        agent_id: &str,
        expected: Option<&RouteClaim>,
        claim: &RouteClaim,
        _ttl: Duration,
    ) -> Result<bool, RoutingError> {
        let mut entries = self.entries.lock();
        if entries.get(agent_id) != expected {
            return Ok(false);
        }
        entries.insert(agent_id.to_string(), claim.clone());
        Ok(true)
    }

    async fn compare_and_delete(
        &self,
        agent_id: &str,
        expected: &RouteClaim,
    ) -> Result<bool, RoutingError> {
        let mut entries = self.entries.lock();
        if entries.get(agent_id) == Some(expected) {
            entries.remove(agent_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn refresh(
        &self,
        agent_id: &str,
        claim: &RouteClaim,
        _ttl: Duration,
    ) -> Result<bool, RoutingError> {
        Ok(self.entries.lock().get(agent_id) == Some(claim))
    }
}
