use anyhow::Result;

use dirsync::{config::Config, protocol::SIGNATURE};

pub fn run(config: &Config) -> Result<()> {
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Protocol: {}", String::from_utf8_lossy(&SIGNATURE));
    match Config::default_path() {
        Some(path) => println!("Default config: {}", path.display()),
        None => println!("Default config: unavailable"),
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
