//! Mesh node - overlay mesh daemon.
//!
//! This is the main entry point for the mesh-node binary.

use anyhow::Result;
use clap::Parser;
use mesh_peer::{Config as PeerConfig, Manager};
use mesh_router::{Config as RouterConfig, Router};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::NodeConfig;

/// Overlay mesh node.
#[derive(Parser, Debug)]
#[command(name = "mesh-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mesh-node.toml")]
    config: PathBuf,

    /// Network, `scheme:host`
    #[arg(short, long)]
    network: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Seed node to dial at startup (repeatable)
    #[arg(long)]
    seed: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting mesh-node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    let chain_coord = config.parse_chain_coord()?;

    info!("Node: {}", config.node_name);
    info!("Network: {}:{}", config.network, config.port);
    info!("Data directory: {:?}", config.data_dir);
    info!("Chain coordinate: {}", chain_coord);

    std::fs::create_dir_all(&config.data_dir)?;

    let peer_config = PeerConfig {
        store_path: config.node_store_path().to_string_lossy().into_owned(),
        ban_evil_score: config.ban_evil_score.unwrap_or(100),
    };

    let mut router_config = RouterConfig::new(
        config.network.clone(),
        config.port,
        config.router_store_path().to_string_lossy().into_owned(),
    );
    // The peer config's threshold fills in when the node config omits the
    // router's own.
    router_config.ban_evil_score = config.ban_evil_score.unwrap_or(peer_config.ban_evil_score);
    router_config.handshake_timeout = Duration::from_secs(config.handshake_timeout_secs);

    let router = Router::new(router_config).await?;
    let manager = Manager::new(chain_coord, router.clone(), &peer_config)?;
    manager.start_manage();

    for seed in &config.seed_nodes {
        if let Err(e) = manager.add_node(seed) {
            warn!(seed = %seed, error = %e, "seed node rejected");
        }
    }
    manager.enforce_connect().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    router.shutdown();

    Ok(())
}
