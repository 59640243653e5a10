use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use dirsync::{config::Config, sync_manager::SyncManager};

pub async fn run(mut config: Config, root: Option<PathBuf>, server: Option<String>) -> Result<()> {
    if let Some(root) = root {
        config.root_path = root;
    }
    if let Some(server) = server {
        config.server_addr = server;
    }
    let manager = SyncManager::new(config)?;
    manager.sync().await?;
    info!("Sync session ended");
    Ok(())
}
