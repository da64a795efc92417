//! Statemesh daemon
//!
//! Usage:
//!   statemesh [CONFIG_FILE]
//!
//! Loads the TOML configuration (default: statemesh.toml), joins the
//! cluster, and runs until interrupted or self-evicted.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use statemesh::{ClusterNode, Config};

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "statemesh.toml".to_string());

    let config = match Config::from_file(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let node = Arc::new(ClusterNode::new(config));
    if let Err(e) = node.start().await {
        error!("Failed to start cluster node: {}", e);
        return ExitCode::FAILURE;
    }

    let mut shutdown = node.shutdown_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, leaving the cluster");
            node.shutdown().await;
        }
        _ = shutdown.changed() => {
            // Self-eviction: the node already tore itself down
            error!("Node left the cluster, exiting");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
