//! Block-level delta transfer between two copies of a file.
//!
//! The side holding the stale copy publishes a [`ChecksumTable`], the side
//! holding the fresh copy answers with a [`DiffScript`], and the stale side
//! replays it with [`reconstruct`].

pub mod checksum;
pub mod diff;

use std::path::Path;

use bytes::Bytes;

pub use checksum::{build_checksum_table, rolling_checksum, strong_hash, CheckSumRecord, ChecksumTable};
pub use diff::{compute_diff, reconstruct, DiffRecord, DiffScript, TEMP_SUFFIX};

use crate::error::DeltaError;

/// The three delta steps bound to one block size, working on wire payloads.
#[derive(Debug, Clone, Copy)]
pub struct DeltaEngine {
    block_size: usize,
}

impl DeltaEngine {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    pub fn checksum_table(&self, path: &Path) -> Result<Bytes, DeltaError> {
        Ok(build_checksum_table(path, self.block_size)?.encode())
    }

    pub fn diff(&self, table: &[u8], path: &Path) -> Result<Bytes, DeltaError> {
        let table = ChecksumTable::decode(table)?;
        Ok(compute_diff(&table, path, self.block_size)?.encode())
    }

    pub fn apply(&self, script: &Bytes, path: &Path) -> Result<(), DeltaError> {
        let script = DiffScript::decode(script)?;
        reconstruct(&script, path, self.block_size)
    }
}

/// True for scratch files left by an in-progress reconstruction.
pub fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TEMP_SUFFIX))
}
