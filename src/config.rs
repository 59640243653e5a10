use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::{HEADER_LEN, MAX_FRAME_PAYLOAD};

pub const DEFAULT_TRUNCATE_BLOCK_SIZE: u32 = 1024;
pub const DEFAULT_TRANSFER_BLOCK_SIZE: u32 = 4096;
/// Upper bound for both block sizes; peers allocate buffers of this size.
pub const MAX_BLOCK_SIZE: u32 = MAX_FRAME_PAYLOAD as u32;

/// Block sizes both peers must agree on. Sent by the client in
/// `InitSyncConfig` and adopted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParams {
    /// Delta engine block size.
    pub truncate_block_size: u32,
    /// Maximum payload carried by one frame.
    pub transfer_block_size: u32,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            truncate_block_size: DEFAULT_TRUNCATE_BLOCK_SIZE,
            transfer_block_size: DEFAULT_TRANSFER_BLOCK_SIZE,
        }
    }
}

impl SyncParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.truncate_block_size == 0 {
            return Err("truncate_block_size must be non-zero".to_string());
        }
        if (self.transfer_block_size as usize) < HEADER_LEN {
            return Err(format!(
                "transfer_block_size must be at least {HEADER_LEN}, got {}",
                self.transfer_block_size
            ));
        }
        if self.truncate_block_size > MAX_BLOCK_SIZE || self.transfer_block_size > MAX_BLOCK_SIZE {
            return Err(format!(
                "block sizes must not exceed {MAX_BLOCK_SIZE}, got {} and {}",
                self.truncate_block_size, self.transfer_block_size
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the client connects to.
    pub server_addr: String,
    /// Address the server binds.
    pub listen_addr: String,
    pub root_path: PathBuf,
    pub truncate_block_size: u32,
    pub transfer_block_size: u32,
    /// Abort a session when an operation is not acknowledged in time.
    pub ack_timeout_secs: Option<u64>,
    /// Pause between the initial sync and live watching.
    pub settle_delay_ms: u64,
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8909".to_string(),
            listen_addr: "0.0.0.0:8909".to_string(),
            root_path: PathBuf::from("."),
            truncate_block_size: DEFAULT_TRUNCATE_BLOCK_SIZE,
            transfer_block_size: DEFAULT_TRANSFER_BLOCK_SIZE,
            ack_timeout_secs: None,
            settle_delay_ms: 3000,
            queue_capacity: 1000,
        }
    }
}

impl Config {
    /// `<config dir>/dirsync/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dirsync").join("config.json"))
    }

    /// Loads `path`, or the default location when `path` is `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_json(&raw),
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.params().validate().map_err(ConfigError::Invalid)?;
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn params(&self) -> SyncParams {
        SyncParams {
            truncate_block_size: self.truncate_block_size,
            transfer_block_size: self.transfer_block_size,
        }
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_secs.map(Duration::from_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
