//! meshgated — the meshgate gateway daemon.
//!
//! Single binary that assembles the gateway:
//! - Route table and instance registry, loaded from `gateway.toml`
//! - Inbound proxy listener
//! - Active health checking (optional)
//! - Discovery push API (optional)
//! - Config reload on SIGHUP or file change
//!
//! # Usage
//!
//! ```text
//! meshgated run --config /etc/meshgate/gateway.toml
//! meshgated check --config /etc/meshgate/gateway.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use meshgate_core::{GatewayConfig, MAX_POLICY_DURATION};
use meshgate_health::HealthMonitor;
use meshgate_proxy::{Gateway, GatewayServer, HttpUpstream};
use meshgate_registry::{DiscoveryCoalescer, InstanceRegistry};
use meshgate_routing::{RouteTable, SharedRouteTable};
use meshgated::check::describe_routes;
use meshgated::{ConfigReloader, DiscoveryState, build_router};

#[derive(Parser)]
#[command(name = "meshgated", about = "meshgate API gateway daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Run {
        /// Path to gateway.toml.
        #[arg(long, default_value = "gateway.toml")]
        config: PathBuf,

        /// Override `server.listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Override `server.discovery_listen`.
        #[arg(long)]
        discovery_listen: Option<SocketAddr>,

        /// Poll the config file for changes every N seconds.
        #[arg(long)]
        reload_interval: Option<u64>,
    },
    /// Validate a configuration file and print the compiled routes.
    Check {
        /// Path to gateway.toml.
        #[arg(long, default_value = "gateway.toml")]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,meshgated=debug,meshgate=debug"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            listen,
            discovery_listen,
            reload_interval,
        } => run(config, listen, discovery_listen, reload_interval).await,
        Command::Check { config } => check(config),
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(&path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    let table = RouteTable::from_config(&config)?;
    let services = config.static_services()?;
    if let Some(health) = &config.health {
        health.validate()?;
    }

    println!("{}: ok", path.display());
    println!("routes ({}):", table.len());
    for line in describe_routes(&table) {
        println!("{line}");
    }
    println!("static services: {}", services.len());
    Ok(())
}

async fn run(
    path: PathBuf,
    listen: Option<SocketAddr>,
    discovery_listen: Option<SocketAddr>,
    reload_interval: Option<u64>,
) -> anyhow::Result<()> {
    info!(config = %path.display(), "meshgate daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    // `[server]` is startup-only and sizes the gateway before routes load.
    let server_config = GatewayConfig::from_file(&path)
        .with_context(|| format!("invalid configuration {}", path.display()))?
        .server;

    let registry = Arc::new(InstanceRegistry::new());
    let routes = Arc::new(SharedRouteTable::default());
    let gateway = Arc::new(
        Gateway::new(routes.clone(), registry.clone(), HttpUpstream::new())
            .with_max_replayable_body_bytes(server_config.max_replayable_body_bytes),
    );
    // Discovery publishes through the gateway so departed instances
    // lose their breaker and balancer state.
    let coalescer = Arc::new(DiscoveryCoalescer::new(gateway.clone()));

    let reloader = Arc::new(ConfigReloader::new(
        path.clone(),
        routes.clone(),
        registry.clone(),
        coalescer.clone(),
    ));
    let config = reloader
        .load()
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    info!(routes = routes.load().len(), "configuration loaded");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Start background tasks ─────────────────────────────────

    if let Some(health) = config.health.clone() {
        let monitor = HealthMonitor::new(coalescer.clone(), health);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            monitor.run(shutdown).await;
        }));
        info!("health monitor started");
    }

    {
        let reloader = reloader.clone();
        let shutdown = shutdown_rx.clone();
        let poll = reload_interval
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s).min(MAX_POLICY_DURATION));
        handles.push(tokio::spawn(async move {
            reloader.run(poll, shutdown).await;
        }));
    }

    // ── Start discovery API ────────────────────────────────────

    if let Some(addr) = discovery_listen.or(server_config.discovery_listen) {
        let router = build_router(DiscoveryState {
            coalescer: coalescer.clone(),
            registry: registry.clone(),
        });
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind discovery API on {addr}"))?;
        info!(%addr, "discovery API listening");

        let mut shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "discovery API stopped with error");
            }
        }));
    }

    // ── Start gateway listener ─────────────────────────────────

    let server = GatewayServer::bind(listen.unwrap_or(server_config.listen), gateway).await?;
    let serving = tokio::spawn(server.serve(shutdown_rx.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    serving.await??;
    for handle in handles {
        let _ = handle.await;
    }

    info!("meshgate daemon stopped");
    Ok(())
}
