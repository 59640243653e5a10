use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dirsync::config::Config;

mod info;
mod serve;
mod sync;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to <config dir>/dirsync/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version, protocol and effective configuration
    Info,
    /// Accept a client and mirror its changes into the root
    Serve {
        /// Directory to mirror into
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Push a local directory to a server and keep it in sync
    Sync {
        /// Directory to watch
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Server address
        #[arg(short, long)]
        server: Option<String>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        match self.command {
            Commands::Info => info::run(&config)?,
            Commands::Serve { root, listen } => serve::run(config, root, listen).await?,
            Commands::Sync { root, server } => sync::run(config, root, server).await?,
        }
        Ok(())
    }
}
