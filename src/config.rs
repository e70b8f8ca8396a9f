use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::RetryPolicy;
use crate::hub::{AgentAuth, HubSettings};
use crate::idle::IdleSettings;
use crate::proxy::{ProxySettings, RelayLimits};

/// Control-plane config, loaded from TOML. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerSection,
    pub agents: AgentsSection,
    pub dispatch: DispatchSection,
    pub idle: IdleSection,
    pub proxy: ProxySection,
    pub routing: RoutingSection,
    /// Other control-plane processes, for forwarding deliveries.
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Identity of this process in the routing table. Defaults to the hostname.
    pub process_id: Option<String>,
    /// Base URL agents use to dial tunnels back to this process.
    pub advertise_url: Option<String>,
    /// Bearer token for the public API.
    pub api_token: Option<String>,
    /// Bearer token for `/internal/*` peer routes.
    pub cluster_token: Option<String>,
    /// HMAC key for stream tokens.
    pub stream_secret: Option<String>,
    /// Command journal file. Without one, commands live in memory only.
    pub journal: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    /// Token every agent may register with.
    pub fleet_token: Option<String>,
    /// Per-agent tokens; these take precedence over the fleet token.
    pub tokens: HashMap<String, String>,
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats: u32,
    pub handshake_timeout_secs: u64,
    pub tunnel_timeout_secs: u64,
    /// How often silent sockets are looked for and closed.
    pub watchdog_interval_ms: u64,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            fleet_token: None,
            tokens: HashMap::new(),
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            handshake_timeout_secs: 10,
            tunnel_timeout_secs: 15,
            watchdog_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_secs: u64,
    pub jitter: f64,
    pub max_attempts: u32,
    pub max_total_wait_secs: u64,
    pub ack_timeout_secs: u64,
    pub scan_interval_ms: u64,
    pub scan_batch: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let p = RetryPolicy::default();
        Self {
            initial_backoff_ms: p.initial_backoff.as_millis() as u64,
            multiplier: p.multiplier,
            max_backoff_secs: p.max_backoff.as_secs(),
            jitter: p.jitter,
            max_attempts: p.max_attempts,
            max_total_wait_secs: p.max_total_wait.as_secs(),
            ack_timeout_secs: p.ack_timeout.as_secs(),
            scan_interval_ms: p.scan_interval.as_millis() as u64,
            scan_batch: p.scan_batch,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleSection {
    /// Default idle threshold; 0 disables idle hibernation.
    pub threshold_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for IdleSection {
    fn default() -> Self {
        Self {
            threshold_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub token_ttl_secs: u64,
    pub idle_timeout_secs: u64,
    pub slow_consumer_grace_ms: u64,
    pub touch_interval_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            token_ttl_secs: 300,
            idle_timeout_secs: 300,
            slow_consumer_grace_ms: 5000,
            touch_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub backend: RoutingBackend,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub process_id: String,
    /// Base URL of the peer's HTTP listener.
    pub url: String,
}

impl FleetConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Warn if the config file is world-readable (may contain tokens).
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing.backend == RoutingBackend::Redis && self.routing.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "routing.backend = \"redis\" requires routing.redis_url".into(),
            ));
        }
        if self.agents.missed_heartbeats == 0 {
            return Err(ConfigError::Invalid("agents.missed_heartbeats must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.dispatch.jitter) {
            return Err(ConfigError::Invalid("dispatch.jitter must be in [0, 1)".into()));
        }
        if self.dispatch.multiplier < 1.0 {
            return Err(ConfigError::Invalid("dispatch.multiplier must be at least 1".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.process_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "peer {} is listed twice",
                    peer.process_id
                )));
            }
        }
        if !self.peers.is_empty() && self.server.cluster_token.is_none() {
            return Err(ConfigError::Invalid(
                "peers require server.cluster_token to guard /internal routes".into(),
            ));
        }
        Ok(())
    }

    pub fn process_id(&self) -> String {
        resolve_hostname(&self.server)
    }

    pub fn agent_auth(&self) -> AgentAuth {
        AgentAuth::new(self.agents.fleet_token.clone(), self.agents.tokens.clone())
    }

    pub fn hub_settings(&self, process_id: String, advertise_url: String) -> HubSettings {
        HubSettings {
            process_id,
            advertise_url,
            default_heartbeat_interval: Duration::from_secs(self.agents.heartbeat_interval_secs.max(1)),
            missed_heartbeats: self.agents.missed_heartbeats,
            handshake_timeout: Duration::from_secs(self.agents.handshake_timeout_secs),
            tunnel_timeout: Duration::from_secs(self.agents.tunnel_timeout_secs),
            watchdog_interval: Duration::from_millis(self.agents.watchdog_interval_ms.max(10)),
            forwarded_ack_timeout: Duration::from_secs(self.dispatch.ack_timeout_secs.max(1) * 2),
            ..HubSettings::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let d = &self.dispatch;
        RetryPolicy {
            initial_backoff: Duration::from_millis(d.initial_backoff_ms),
            multiplier: d.multiplier,
            max_backoff: Duration::from_secs(d.max_backoff_secs),
            jitter: d.jitter,
            max_attempts: d.max_attempts,
            max_total_wait: Duration::from_secs(d.max_total_wait_secs),
            ack_timeout: Duration::from_secs(d.ack_timeout_secs),
            scan_interval: Duration::from_millis(d.scan_interval_ms.max(10)),
            scan_batch: d.scan_batch.max(1),
        }
    }

    pub fn idle_settings(&self) -> IdleSettings {
        IdleSettings {
            default_threshold: match self.idle.threshold_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            sweep_interval: Duration::from_secs(self.idle.sweep_interval_secs.max(1)),
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            token_ttl: Duration::from_secs(self.proxy.token_ttl_secs),
            touch_interval: Duration::from_secs(self.proxy.touch_interval_secs),
            limits: RelayLimits {
                idle_timeout: Duration::from_secs(self.proxy.idle_timeout_secs.max(1)),
                slow_consumer_grace: Duration::from_millis(self.proxy.slow_consumer_grace_ms),
            },
        }
    }

    pub fn peer_urls(&self) -> HashMap<String, String> {
        self.peers
            .iter()
            .map(|p| (p.process_id.clone(), p.url.clone()))
            .collect()
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
///
/// On Unix, checks `st_mode & 0o004` (world-readable bit). If set, logs a
/// warning because the config file may contain authentication tokens.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain tokens -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

/// Resolve the process id. Uses the config override if present,
/// otherwise falls back to the system hostname.
pub fn resolve_hostname(server: &ServerSection) -> String {
    if let Some(id) = &server.process_id {
        return id.clone();
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: FleetConfig = toml::from_str("").unwrap();
        assert!(config.peers.is_empty());
        assert_eq!(config.routing.backend, RoutingBackend::Memory);
        assert_eq!(config.agents.heartbeat_interval_secs, 30);
        assert_eq!(config.idle.threshold_secs, 1800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            process_id = "cp-1"
            advertise_url = "http://10.0.0.5:8080"
            api_token = "api"
            cluster_token = "cluster"
            stream_secret = "hmac"
            journal = "/var/lib/fleetd/commands.jsonl"

            [agents]
            fleet_token = "fleet"
            heartbeat_interval_secs = 10
            [agents.tokens]
            "node-1" = "special"

            [dispatch]
            max_attempts = 5
            ack_timeout_secs = 20

            [idle]
            threshold_secs = 0

            [routing]
            backend = "redis"
            redis_url = "redis://127.0.0.1/"

            [[peers]]
            process_id = "cp-2"
            url = "http://10.0.0.6:8080"
        "#;
        let config: FleetConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.process_id(), "cp-1");
        assert_eq!(config.agents.tokens.get("node-1").map(String::as_str), Some("special"));

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.ack_timeout, Duration::from_secs(20));
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));

        assert!(config.idle_settings().default_threshold.is_none());
        let hub = config.hub_settings("cp-1".into(), "http://x".into());
        assert_eq!(hub.default_heartbeat_interval, Duration::from_secs(10));
        assert_eq!(hub.watchdog_interval, Duration::from_secs(1));
        assert_eq!(hub.forwarded_ack_timeout, Duration::from_secs(40));
        assert_eq!(config.peer_urls().get("cp-2").map(String::as_str), Some("http://10.0.0.6:8080"));

        assert!(config.agent_auth().verify("node-1", "special").is_ok());
        assert!(config.agent_auth().verify("node-2", "fleet").is_ok());
    }

    #[test]
    fn redis_backend_needs_url() {
        let config: FleetConfig = toml::from_str("[routing]\nbackend = \"redis\"\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_peers_are_rejected() {
        let toml = r#"
            [[peers]]
            process_id = "cp-2"
            url = "http://a"
            [[peers]]
            process_id = "cp-2"
            url = "http://b"
        "#;
        let config: FleetConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn peers_without_cluster_token_are_rejected() {
        let toml = r#"
            [[peers]]
            process_id = "cp-2"
            url = "http://a"
        "#;
        let config: FleetConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let toml = format!("[server]\ncluster_token = \"c\"\n{toml}");
        let config: FleetConfig = toml::from_str(&toml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FleetConfig::load(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetd.toml");
        std::fs::write(&path, "[server\nprocess_id = 1").unwrap();
        assert!(matches!(FleetConfig::load(&path), Err(ConfigError::ParseFailed(..))));
    }

    #[test]
    fn resolve_hostname_falls_back_to_system() {
        let hostname = resolve_hostname(&ServerSection::default());
        assert!(!hostname.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn is_world_readable_detects_644() {
        assert!(is_world_readable(0o644));
        assert!(!is_world_readable(0o600));
    }

    #[cfg(unix)]
    #[test]
    fn check_permissions_world_readable_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetd.toml");
        std::fs::write(&path, "# test").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert!(mode & 0o004 != 0, "file should be world-readable");

        // Only warns.
        check_config_permissions(&path);
        assert!(FleetConfig::load(&path).unwrap().is_some());
    }
}
