//! hostel-gateway
//!
//! An SSH gateway that authenticates users by public key and places each
//! interactive session inside a freshly spawned container.

mod auth;
mod config;
mod container;
mod docker;
mod ssh;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::auth::Authenticator;
use crate::config::GatewayConfig;
use crate::docker::DockerSpawner;
use crate::ssh::ServerState;

/// SSH gateway that places each session in a fresh container
#[derive(Parser, Debug)]
#[command(name = "hostel-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hostel/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = GatewayConfig::default().populate();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
        .populate();

    // Apply CLI overrides
    if let Some(listen) = cli.listen.as_deref() {
        config.set_listen(listen)?;
    }

    config.ensure_dirs()?;

    info!("Starting hostel-gateway");
    info!("  Listen address: {}", config.listen_addr());
    info!("  Default image: {}", config.defaults.image);
    info!(
        "  Authorized keys: {}",
        config.authorized_keys_dir.display()
    );

    let authenticator = Authenticator::new(&config.authorized_keys_dir)
        .context("Failed to initialise authenticator")?;

    let spawner = Arc::new(
        DockerSpawner::new(config.docker_socket.as_deref())
            .await
            .context("Failed to initialise container spawner")?,
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let state = Arc::new(ServerState {
        config: Arc::new(config),
        authenticator,
        spawner,
        shutdown,
    });

    // Run SSH server
    ssh::run_server(state).await
}
