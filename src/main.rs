//! AEGIS guard service
//!
//! Loads a [`GuardConfig`], builds the security orchestrator and serves its
//! HTTP API until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aegis_guard::config::GuardConfig;
use aegis_guard::orchestrator::SecurityOrchestrator;
use aegis_guard::server::{self, GuardApi};

#[derive(Parser, Debug)]
#[command(name = "aegis-guard")]
#[command(about = "AEGIS guard - input validation, threat scoring and rate limiting service", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (RUST_LOG overrides)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GuardConfig::from_file(path)?,
        None => GuardConfig::default(),
    };
    config.validate().context("Invalid configuration")?;

    if cli.check_config {
        info!("Configuration OK");
        return Ok(());
    }

    let addr = match cli.bind {
        Some(addr) => addr,
        None => config.server.bind_addr()?,
    };

    let store = config.store.open()?;
    let orchestrator = SecurityOrchestrator::builder()
        .store(store)
        .config(config)
        .build()
        .context("Failed to build security orchestrator")?;
    orchestrator.start_background_tasks();

    info!("AEGIS guard v{}", env!("CARGO_PKG_VERSION"));
    info!("Endpoints:");
    info!("  - POST /validate          - Validate a value against a rule set");
    info!("  - POST /check-rate-limit  - Record an attempt and check quotas");
    info!("  - POST /analyze-threat    - Threat analysis for an input");
    info!("  - POST /process           - Full allow/monitor/block decision");
    info!("  - GET  /health            - Health check (JSON)");
    info!("  - GET  /metrics           - Metrics (JSON or ?format=prometheus)");

    let api = Arc::new(GuardApi::new(Arc::new(orchestrator)));
    let (local_addr, server) = server::serve(addr, api)?;
    info!("Server ready on http://{} - press Ctrl+C to stop", local_addr);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
