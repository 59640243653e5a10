//! Two-party directory synchronization over a framed TCP protocol, with
//! rsync-style delta transfer for modified files.

pub mod config;
pub mod error;
pub mod event;
pub mod fsops;
pub mod protocol;
pub mod pump;
pub mod rsync;
pub mod session;
pub mod sync_manager;
pub mod transport;
pub mod watcher;
