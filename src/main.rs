//! Task Router - Main Entry Point
//!
//! Loads the router configuration, runs preflight against every registered
//! agent and serves the HTTP surface until SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use task_router::collaborators::{ArchivalService, AuditSink, HttpArchivalClient, HttpAuditSink};
use task_router::observability::{init_logging, LoggingConfig};
use task_router::server::{self, AppState};
use task_router::transport::{AgentTransport, HttpAgentTransport};
use task_router::{AgentRegistry, Dispatcher, PreflightValidator, ReadinessState, RouterConfig};
use tokio::signal;
use tracing::{error, info, warn};

/// Task router for backend agent services
#[derive(Parser)]
#[command(name = "task-router")]
#[command(about = "Routes typed tasks to backend agents behind one result contract")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run preflight, then serve requests
    Serve,
    /// Probe every agent once and print the reports
    Preflight,
    /// Validate configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&LoggingConfig::from_env().with_verbosity(cli.verbose));

    info!("Starting task router v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Preflight => preflight_once(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<RouterConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(RouterConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["router.toml", "config/router.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(RouterConfig::load_from_file(&path)?);
                }
            }

            Err("no configuration file found; pass -c/--config or create router.toml".into())
        }
    }
}

/// Wired-up router components
struct Router {
    validator: Arc<PreflightValidator>,
    state: AppState,
}

/// Bootstrap: construct every component from configuration
fn build_router(config: &RouterConfig) -> Result<Router, Box<dyn std::error::Error>> {
    let registry = Arc::new(AgentRegistry::from_config(config));
    let transport: Arc<dyn AgentTransport> = Arc::new(HttpAgentTransport::new());
    let readiness = Arc::new(ReadinessState::new());

    let validator = Arc::new(PreflightValidator::new(
        Arc::clone(&registry),
        Arc::clone(&transport),
        Arc::clone(&readiness),
        config.router.probe_timeout(),
    ));

    let mut dispatcher = Dispatcher::new(config, registry, readiness, transport);
    if let Some(audit) = &config.audit {
        info!(url = %audit.url, "Audit sink enabled for LIVE runs");
        let sink: Arc<dyn AuditSink> = Arc::new(HttpAuditSink::new(audit)?);
        dispatcher = dispatcher.with_audit_sink(sink);
    }

    let mut state = AppState::new(Arc::new(dispatcher));
    if let Some(archival) = &config.archival {
        let client: Arc<dyn ArchivalService> = Arc::new(HttpArchivalClient::new(archival)?);
        state = state.with_archival(client);
    }

    Ok(Router { validator, state })
}

async fn serve(config: RouterConfig) -> Result<(), Box<dyn std::error::Error>> {
    let router = build_router(&config)?;

    // Readiness stays closed until this run completes
    let reports = router.validator.run_preflight().await;
    if !router.state.readiness.is_ready() {
        warn!(
            agents = reports.len(),
            "Starting in not-ready state; every request will be refused until preflight passes"
        );
    }

    if let Some(interval) = config.router.preflight_interval() {
        info!(interval_secs = interval.as_secs(), "Periodic preflight enabled");
        Arc::clone(&router.validator).spawn_periodic(interval);
    }

    let port = std::env::var("ROUTER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.server.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    // Set up signal handling for graceful shutdown
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    };

    server::serve(router.state, addr, shutdown).await?;
    Ok(())
}

async fn preflight_once(config: RouterConfig) -> Result<(), Box<dyn std::error::Error>> {
    let router = build_router(&config)?;
    let reports = router.validator.run_preflight().await;

    println!("{}", serde_json::to_string_pretty(&reports)?);

    if router.state.readiness.is_ready() {
        Ok(())
    } else {
        Err("preflight failed: mandatory agents unavailable".into())
    }
}

fn handle_config_command(config: &RouterConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!(
            "Configuration is valid: {} agents ({} mandatory)",
            config.agents.len(),
            config.agents.iter().filter(|a| a.mandatory).count()
        );
    }
    Ok(())
}
