//! Fleet - control plane for remotely managed telemetry agents
//!
//! Accepts agent connections over WebSocket, tracks them by tenant, group and
//! deployment, and pushes configuration to them.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fleet_auth::{
    async_trait, AuthError, CredentialVerifier, InMemoryAssignmentResolver, JwtVerifier,
    StaticTokenVerifier,
};
use fleet_control::{ControlPlane, ControlPlaneServer, DistributorConfig, ServerSettings};
use fleet_transport_websocket::{WebSocketConfig, WebSocketEndpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

/// Fleet - manage telemetry agents from one control plane
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(about = "Fleet - manage telemetry agents from one control plane")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Address to listen on for agent connections
    #[arg(long, env = "FLEET_LISTEN", default_value = "0.0.0.0:4320")]
    listen: SocketAddr,

    /// HTTP path agents upgrade on
    #[arg(long, env = "FLEET_PATH", default_value = "/v1/opamp")]
    path: String,

    /// Secret for HS256 agent tokens
    #[arg(long, env = "FLEET_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Static agent tokens as "token=tenant,token=tenant"
    #[arg(long, env = "FLEET_TOKENS")]
    tokens: Option<String>,

    /// Request header naming the agent group
    #[arg(long, env = "FLEET_GROUP_HEADER", default_value = "agent-group")]
    group_header: String,

    /// Request header naming the deployment
    #[arg(long, env = "FLEET_DEPLOYMENT_HEADER", default_value = "deployment")]
    deployment_header: String,

    /// Close connections silent for this many seconds
    #[arg(long, env = "FLEET_IDLE_TIMEOUT", default_value = "60")]
    idle_timeout: u64,

    /// Ping interval in seconds
    #[arg(long, env = "FLEET_KEEP_ALIVE", default_value = "30")]
    keep_alive: u64,

    /// Largest accepted agent message in bytes
    #[arg(long, env = "FLEET_MAX_MESSAGE_SIZE")]
    max_message_size: Option<usize>,

    /// Dotted path of the config section managed by pushes
    #[arg(long, env = "FLEET_CONFIG_SECTION", default_value = "processors.tail_sampling")]
    config_section: String,

    /// Default wait for push confirmation, in seconds
    #[arg(long, env = "FLEET_ACK_TIMEOUT", default_value = "5")]
    ack_timeout: u64,

    /// Interval between fleet summary log lines, in seconds (0 disables)
    #[arg(long, env = "FLEET_SUMMARY_INTERVAL", default_value = "60")]
    summary_interval: u64,

    /// Log output format
    #[arg(long, env = "FLEET_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging; `RUST_LOG` wins over the verbosity flag
fn setup_logging(verbose: bool, format: LogFormat) {
    let fallback = if verbose {
        "fleet=debug,fleet_control=debug,fleet_transport_websocket=debug,fleet_auth=debug"
    } else {
        "fleet=info,fleet_control=info,fleet_transport_websocket=info,fleet_auth=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Tries each verifier in order; the first that knows the credential decides
struct ChainedVerifier {
    verifiers: Vec<Arc<dyn CredentialVerifier>>,
}

#[async_trait]
impl CredentialVerifier for ChainedVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let mut last_error = AuthError::UnknownCredential;
        for verifier in &self.verifiers {
            match verifier.verify(token).await {
                Ok(tenant) => return Ok(tenant),
                Err(AuthError::TokenExpired) => return Err(AuthError::TokenExpired),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

fn build_verifier(cli: &Cli) -> Result<Arc<dyn CredentialVerifier>> {
    let mut verifiers: Vec<Arc<dyn CredentialVerifier>> = Vec::new();

    if let Some(tokens) = cli.tokens.as_deref().filter(|t| !t.trim().is_empty()) {
        let table = StaticTokenVerifier::parse(tokens).context("Invalid --tokens value")?;
        info!("Loaded {} static agent token(s)", table.len());
        verifiers.push(Arc::new(table));
    }

    if let Some(secret) = cli.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
        info!("JWT agent authentication enabled");
        verifiers.push(Arc::new(JwtVerifier::new(secret.as_bytes())));
    }

    match verifiers.len() {
        0 => anyhow::bail!(
            "No agent authentication configured: set --jwt-secret (FLEET_JWT_SECRET) or --tokens (FLEET_TOKENS)"
        ),
        1 => Ok(verifiers.remove(0)),
        _ => Ok(Arc::new(ChainedVerifier { verifiers })),
    }
}

fn websocket_config(cli: &Cli) -> WebSocketConfig {
    let mut config = WebSocketConfig::default()
        .with_path(&cli.path)
        .with_keep_alive(Duration::from_secs(cli.keep_alive))
        .with_idle_timeout(Duration::from_secs(cli.idle_timeout));
    if let Some(size) = cli.max_message_size {
        config = config.with_max_message_size(size);
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_format);

    info!(
        "Fleet control plane {} (commit {}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let verifier = build_verifier(&cli)?;
    let resolver = Arc::new(InMemoryAssignmentResolver::new());

    let settings = ServerSettings::default()
        .with_group_header(&cli.group_header)
        .with_deployment_header(&cli.deployment_header);
    let distributor_config = DistributorConfig::default()
        .with_section(&cli.config_section)
        .with_default_timeout(Duration::from_secs(cli.ack_timeout));

    let plane = ControlPlane::new(verifier, resolver, settings, distributor_config);

    let endpoint = WebSocketEndpoint::new(plane.server(), Arc::new(websocket_config(&cli)))
        .context("Invalid WebSocket configuration")?;
    let shutdown = endpoint.shutdown_token();

    let listener = WebSocketEndpoint::<ControlPlaneServer>::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;

    if cli.summary_interval > 0 {
        let plane = plane.clone();
        let shutdown = shutdown.clone();
        let period = Duration::from_secs(cli.summary_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = plane.summary();
                        info!(
                            agents = summary.agents,
                            tenants = summary.tenants,
                            groups = summary.groups,
                            deployments = summary.deployments,
                            "Fleet summary"
                        );
                    }
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down...");
                    shutdown.cancel();
                }
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    if let Err(e) = endpoint.serve(listener).await {
        error!("Server error: {}", e);
        return Err(e).context("WebSocket endpoint failed");
    }

    info!("Fleet stopped");
    Ok(())
}
