//! `agentmeshd` — run a manager instance until interrupted.
//!
//! Environment:
//! - `AGENTMESH_DATA_DIR`  override the data directory
//! - `AGENTMESH_PORT`      preferred dashboard port (default 3900)
//! - `AGENTMESH_INDEX_URL` index-server side channel base URL
//! - `RUST_LOG`            log filter (env_logger)

use agentmesh::{Manager, ManagerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = ManagerConfig::default();
    if let Ok(dir) = std::env::var("AGENTMESH_DATA_DIR") {
        config.data_dir = dir.into();
    }
    if let Ok(port) = std::env::var("AGENTMESH_PORT") {
        config.dashboard_port = port.parse().unwrap_or(config.dashboard_port);
    }
    if let Ok(url) = std::env::var("AGENTMESH_INDEX_URL") {
        config.index_server = Some(url);
    }

    let manager = Manager::start(config).await?;
    log::info!(
        "agentmeshd: running (pid {}, dashboard port {:?})",
        std::process::id(),
        manager.dashboard_port()
    );

    tokio::signal::ctrl_c().await?;
    manager.shutdown().await;
    Ok(())
}
