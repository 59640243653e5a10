use anyhow::Result;
use std::path::PathBuf;

use dirsync::{config::Config, sync_manager::SyncManager};

pub async fn run(mut config: Config, root: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    if let Some(root) = root {
        config.root_path = root;
    }
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    SyncManager::new(config)?.serve().await
}
