//! Identity Gateway - CLI Application
//!
//! Starts the gateway, validates a configuration, or writes a sample one.
//! Without `--config`, the built-in identity-cell routes are used with
//! upstreams read from `AUTH_SERVICE_URL` and `ACCOUNT_SERVICE_URL`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use identity_gateway::{
    config::GatewayConfig,
    server::{build_router, serve, shutdown_signal, AppState},
};
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Identity Gateway - prefix-routing API gateway
#[derive(Parser)]
#[command(name = "identity-gateway")]
#[command(version, about = "Prefix-routing API gateway for the identity cell", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path (built-in routes when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Log level used when RUST_LOG is not set
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Validate the configuration and resolve every upstream
    Validate {
        /// Configuration file path (built-in routes when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "gateway.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start { config, log_level } => start_server(config.as_deref(), &log_level).await,
        Commands::Validate { config } => validate_config(config.as_deref()),
        Commands::Init { output } => generate_sample_config(&output),
    };

    if let Err(err) = result {
        if tracing::dispatcher::has_been_set() {
            error!(error = %format!("{:#}", err), "Gateway exited with an error");
        } else {
            eprintln!("Error: {:#}", err);
        }
        std::process::exit(1);
    }
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn init_logging(level: &str) -> identity_gateway::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

/// Start the gateway server
async fn start_server(config_path: Option<&Path>, log_level: &str) -> identity_gateway::Result<()> {
    init_logging(log_level)?;

    let config = GatewayConfig::load(config_path, &process_env).context("invalid configuration")?;
    match config_path {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("Using built-in identity-cell routes"),
    }

    // Everything that can fail on configuration happens before the bind.
    let state =
        AppState::from_config(&config, &process_env).context("invalid route configuration")?;

    for rule in state.table.rules() {
        info!(
            route = rule.name(),
            prefix = rule.public_prefix(),
            rewrite = rule.internal_rewrite_prefix(),
            upstream = rule.upstream().base(),
            description = rule.description().unwrap_or_default(),
            "Route configured"
        );
    }
    info!(timeout = ?state.forwarder.timeout(), "Upstream timeout configured");
    if state.table.is_empty() {
        warn!("No routes configured, every proxied request will return 404");
    }
    if config.metrics.enabled {
        info!(path = %config.metrics.path, "Metrics endpoint enabled");
    }
    if config.health.enabled {
        info!(path = %config.health.path, ready_path = %config.health.ready_path, "Health endpoints enabled");
    }

    let router = build_router(&config, state.clone());

    let addr = config.server_addr();
    let listener = TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    serve(listener, router, state.health.clone(), shutdown_signal()).await?;
    Ok(())
}

/// Validate configuration and print the resolved route table
fn validate_config(config_path: Option<&Path>) -> identity_gateway::Result<()> {
    let config = GatewayConfig::load(config_path, &process_env)?;
    let table = config.route_table(&process_env)?;

    println!("✓ Configuration is valid!");
    println!();
    println!("Server: {}", config.server_addr());
    println!("Upstream timeout: {}s", config.server.upstream_timeout);
    println!("Routes: {}", table.len());
    println!();
    for rule in table.rules() {
        println!(
            "  {} → {}{}  ({})",
            rule.public_prefix(),
            rule.upstream().base(),
            rule.internal_rewrite_prefix(),
            rule.name()
        );
        if let Some(description) = rule.description() {
            println!("      {}", description);
        }
    }
    Ok(())
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &Path) -> identity_gateway::Result<()> {
    std::fs::write(output_path, GatewayConfig::sample())
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    println!("Sample configuration written to {}", output_path.display());
    Ok(())
}
