use std::path::PathBuf;

/// Normalized local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOp {
    Create,
    Modify,
    Remove,
    Rename,
    Mkdir,
    /// Synthesized during reconciliation: ask the peer for its copy.
    Fetch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub op: FsOp,
    /// Absolute local path.
    pub path: PathBuf,
    /// Pre-rename path, set only for `Rename`.
    pub origin_path: Option<PathBuf>,
}

impl FsEvent {
    pub fn new(op: FsOp, path: impl Into<PathBuf>) -> Self {
        Self {
            op,
            path: path.into(),
            origin_path: None,
        }
    }

    pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            op: FsOp::Rename,
            path: to.into(),
            origin_path: Some(from.into()),
        }
    }
}
