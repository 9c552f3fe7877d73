//! Wharf daemon binary.
//!
//! Loads configuration, starts the connection server and runs until a
//! shutdown signal arrives.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use wharf::{Config, Server};

/// Wharf p2p connection server
#[derive(Parser, Debug)]
#[command(name = "wharfd", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("wharfd starting");

    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("no config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "loaded config file");
        }
    }

    if !config.has_identity() {
        warn!("no identity configured, generating ephemeral keypair");
    }

    let server_config = match config.into_server_config() {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let server = Server::new(server_config);
    if let Err(e) = server.start().await {
        error!("failed to start server: {}", e);
        std::process::exit(1);
    }

    info!(id = %server.node_id(), "node identity");
    if let Some(addr) = server.listen_addr() {
        info!(record = %server.local_record(), address = %addr, "node endpoint");
    }

    info!("wharfd running, press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("failed to wait for shutdown signal: {}", e),
    }

    info!(peers = server.peer_count().await, "wharfd shutting down");
    server.stop().await;
    info!("wharfd shutdown complete");
}
