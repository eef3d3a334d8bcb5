use anyhow::{Context, Result};
use shardvault_core::{init_tracing, NodeConfig, StorageNode};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,libp2p=warn");

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => NodeConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            tracing::warn!("No config file given, using defaults");
            NodeConfig::default()
        }
    };

    tracing::info!(
        "ShardVault node {} starting on {}:{}",
        config.server_name,
        config.hostname,
        config.port
    );

    let node = StorageNode::start(config).await.context("starting node")?;
    node.run().await?;
    Ok(())
}
