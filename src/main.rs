//! fleetd - fleet control plane
//!
//! ## Modes
//!
//! **Server** (`fleetd server`): runs one control-plane process. Agents dial
//! in over WebSocket; the HTTP API creates sessions and dispatches commands.
//!
//! **Agent** (`fleetd agent`): the reference agent. Connects to a control
//! plane, acks commands and pipes one workload TCP address for stream
//! tunnels.
//!
//! **Token** (`fleetd token`): mints a stream token offline from the shared
//! stream secret.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetd::{
    agent::{AgentClient, AgentSettings, StaticExecutor},
    config::{ConfigError, FleetConfig},
    protocol::Platform,
    proxy::{StreamTokenSigner, TokenError},
    server::{ControlPlane, ServerError, ServerOptions},
};

/// fleetd - fleet control plane
#[derive(ClapParser, Debug)]
#[command(name = "fleetd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a control-plane process
    Server {
        /// Address to bind the HTTP/WebSocket server
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Path to the TOML config file
        #[arg(long, env = "FLEETD_CONFIG", default_value = "fleetd.toml")]
        config: PathBuf,

        /// Bearer token for the session API (overrides server.api_token)
        #[arg(long, env = "FLEETD_TOKEN")]
        token: Option<String>,

        /// Base URL agents dial back to; defaults to http://<bind>
        #[arg(long, env = "FLEETD_ADVERTISE_URL")]
        advertise_url: Option<String>,

        /// Allowed CORS origin (repeatable)
        #[arg(long = "cors-origin")]
        cors_origins: Vec<String>,

        /// Seconds to wait for in-flight commands on shutdown
        #[arg(long, default_value_t = 10)]
        drain_timeout_secs: u64,
    },

    /// Run the reference agent
    Agent {
        /// Control-plane base URL
        #[arg(long, env = "FLEETD_URL", default_value = "http://127.0.0.1:8080")]
        url: String,

        /// Agent id
        #[arg(long, env = "FLEETD_AGENT_ID")]
        id: String,

        /// Agent auth token
        #[arg(long, env = "FLEETD_AGENT_TOKEN")]
        token: String,

        /// Workload platform: kubernetes or docker
        #[arg(long, default_value = "docker")]
        platform: Platform,

        /// Declared session capacity
        #[arg(long)]
        capacity: Option<u32>,

        /// Capability tag (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// host:port piped to stream clients
        #[arg(long)]
        workload_addr: Option<String>,
    },

    /// Mint a stream token
    Token {
        /// Shared stream secret (server.stream_secret)
        #[arg(long, env = "FLEETD_STREAM_SECRET")]
        secret: String,

        /// Session id
        #[arg(long)]
        session: String,

        /// User id
        #[arg(long)]
        user: String,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 300)]
        ttl_secs: u64,
    },
}

#[derive(Error, Debug)]
pub enum FleetdError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), FleetdError> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            bind,
            config,
            token,
            advertise_url,
            cors_origins,
            drain_timeout_secs,
        } => {
            let opts = ServerOptions {
                advertise_url: advertise_url.unwrap_or_else(|| format!("http://{bind}")),
                api_token: token,
                cors_origins,
                drain_timeout: Duration::from_secs(drain_timeout_secs),
                ..Default::default()
            };
            run_server(bind, config, opts).await
        }
        Commands::Agent {
            url,
            id,
            token,
            platform,
            capacity,
            capabilities,
            workload_addr,
        } => {
            let mut settings = AgentSettings::new(url, id, token);
            settings.platform = platform;
            settings.capacity = capacity;
            settings.capabilities = capabilities;
            run_agent(settings, workload_addr).await
        }
        Commands::Token {
            secret,
            session,
            user,
            ttl_secs,
        } => {
            let token = StreamTokenSigner::new(secret).issue(
                &session,
                &user,
                Duration::from_secs(ttl_secs),
                chrono::Utc::now(),
            )?;
            println!("{token}");
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "fleetd=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(
    bind: SocketAddr,
    config_path: PathBuf,
    opts: ServerOptions,
) -> Result<(), FleetdError> {
    let config = match FleetConfig::load(&config_path)? {
        Some(config) => {
            tracing::info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            tracing::info!(path = %config_path.display(), "no config file; using defaults");
            FleetConfig::default()
        }
    };
    if opts.api_token.is_none() && config.server.api_token.is_none() && !bind.ip().is_loopback() {
        tracing::warn!(addr = %bind, "session API is unauthenticated on a non-loopback address");
    }

    let plane = ControlPlane::build(&config, opts).await?;
    let listener = tokio::net::TcpListener::bind(bind).await?;
    plane
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ── Agent mode ─────────────────────────────────────────────────────

async fn run_agent(settings: AgentSettings, workload_addr: Option<String>) -> Result<(), FleetdError> {
    tracing::info!(agent = %settings.agent_id, url = %settings.server_url, "agent starting");
    let client = AgentClient::new(settings, Arc::new(StaticExecutor::new(workload_addr)));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(client.run(cancel.clone()));

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl+C");
    cancel.cancel();
    if let Err(e) = handle.await {
        tracing::warn!(?e, "agent task panicked");
    }
    Ok(())
}
