mod config;
mod error;
mod network;
mod routes;

use anyhow::Context;
use clap::Parser;
use config::Config;
use network::HttpNetwork;
use orchestrator::{ClusterState, Coordinator};
use raft_core::{FileStorage, RaftNode};
use routes::AppState;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let raft_config = config.raft_config();
    raft_config.validate().context("invalid consensus timing")?;

    info!(
        "Starting node {} with members {:?}, data in {}",
        config.node_id,
        config.members(),
        config.data_dir.display()
    );

    // A damaged log refuses start rather than serving from partial state.
    let storage = FileStorage::open(&config.data_dir)
        .await
        .with_context(|| format!("failed to open log store at {}", config.data_dir.display()))?;

    let peer_urls = config.peer_urls();
    let network = HttpNetwork::new(peer_urls.clone(), raft_config.rpc() * 10).context("failed to build peer client")?;

    let node = RaftNode::new(
        config.node_id,
        config.members(),
        raft_config,
        storage,
        network,
        ClusterState::new(),
    );
    let coordinator = Coordinator::new(node, config.coordinator_config());
    coordinator.start().await.context("failed to start coordinator")?;

    let app = routes::router(AppState::new(coordinator.clone(), peer_urls));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("API server listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    info!("Node {} stopped", config.node_id);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
