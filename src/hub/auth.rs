use std::collections::HashMap;

use subtle::ConstantTimeEq;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials configured for agent {0}")]
    NotConfigured(String),
    #[error("invalid token for agent {0}")]
    InvalidToken(String),
}

/// Agent credential check.
///
/// Cascade order:
/// 1. Per-agent token (explicit in config for this agent id)
/// 2. Fleet-wide token
///
/// An agent with neither configured cannot register.
#[derive(Debug, Clone, Default)]
pub struct AgentAuth {
    fleet_token: Option<String>,
    agent_tokens: HashMap<String, String>,
}

impl AgentAuth {
    pub fn new(fleet_token: Option<String>, agent_tokens: HashMap<String, String>) -> Self {
        Self {
            fleet_token,
            agent_tokens,
        }
    }

    pub fn fleet(token: impl Into<String>) -> Self {
        Self::new(Some(token.into()), HashMap::new())
    }

    fn expected_token(&self, agent_id: &str) -> Option<&str> {
        self.agent_tokens
            .get(agent_id)
            .map(String::as_str)
            .or(self.fleet_token.as_deref())
    }

    pub fn verify(&self, agent_id: &str, token: &str) -> Result<(), AuthError> {
        let expected = self
            .expected_token(agent_id)
            .ok_or_else(|| AuthError::NotConfigured(agent_id.to_string()))?;
        if token.as_bytes().ct_eq(expected.as_bytes()).into() {
            Ok(())
        } else {
            Err(AuthError::InvalidToken(agent_id.to_string()))
        }
    }
}
