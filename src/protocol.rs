//! Agent wire protocol.
//!
//! Agents hold one WebSocket to `/agent/connect` and exchange JSON text
//! frames. Every frame is an object tagged by `type`; field names are
//! camelCase. The command body travels nested under `command` so that its own
//! `type` field (the command type) does not collide with the frame tag.

use serde::{Deserialize, Serialize};

/// Workload platform an agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Kubernetes,
    Docker,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Kubernetes => write!(f, "kubernetes"),
            Platform::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" | "k8s" => Ok(Platform::Kubernetes),
            "docker" => Ok(Platform::Docker),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    #[serde(alias = "create")]
    Start,
    Hibernate,
    Wake,
    Stop,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Start => "start",
            CommandType::Hibernate => "hibernate",
            CommandType::Wake => "wake",
            CommandType::Stop => "stop",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" | "create" => Ok(CommandType::Start),
            "hibernate" => Ok(CommandType::Hibernate),
            "wake" => Ok(CommandType::Wake),
            "stop" => Ok(CommandType::Stop),
            other => Err(format!("unknown command type: {other}")),
        }
    }
}

/// A command as the agent sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCommand {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandAck {
    pub fn success(id: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            id: id.into(),
            status: AckStatus::Success,
            detail,
        }
    }

    pub fn failure(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: AckStatus::Failure,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    pub tunnel_id: String,
    pub session_id: String,
    pub callback_url: String,
}

/// Frames sent by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        agent_id: String,
        auth_token: String,
        platform: Platform,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat_interval_secs: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { agent_id: String },
    CommandAck(CommandAck),
    #[serde(rename_all = "camelCase")]
    TunnelReady { tunnel_id: String, endpoint: String },
    #[serde(rename_all = "camelCase")]
    TunnelError { tunnel_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    Draining { agent_id: String },
}

/// Frames sent by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Registered {
        agent_id: String,
        heartbeat_interval_secs: u64,
    },
    Rejected { reason: String },
    Command { command: AgentCommand },
    TunnelRequest(TunnelRequest),
}

impl AgentMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> String {
        // Serializing these plain structs cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
