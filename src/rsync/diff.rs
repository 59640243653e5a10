//! Diff scripts: how to rebuild a file from literal bytes and blocks of the
//! reference copy.
//!
//! ```text
//! Literal: [0x01][u32 start][u32 end][end - start bytes]
//! Copy:    [0x02][u32 dest_offset][u32 chunk_index]
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::checksum::{strong_hash, CheckSumRecord, ChecksumTable, Rolling, HASH_LEN};
use crate::error::DeltaError;

pub const LITERAL_TAG: u8 = 0x01;
pub const COPY_TAG: u8 = 0x02;

/// Suffix of the scratch file written next to a file being rebuilt.
pub const TEMP_SUFFIX: &str = ".dirsync-tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRecord {
    /// Bytes absent from the reference file, placed at `start..end`.
    Literal { start: u32, end: u32, data: Bytes },
    /// One reference block placed at `dest_offset`.
    Copy { dest_offset: u32, chunk_index: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffScript {
    pub records: Vec<DiffRecord>,
}

impl DiffScript {
    fn push_literal(&mut self, start: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.records.push(DiffRecord::Literal {
            start: start as u32,
            end: (start + data.len()) as u32,
            data: Bytes::copy_from_slice(data),
        });
    }

    fn push_copy(&mut self, dest_offset: usize, chunk_index: u32) {
        self.records.push(DiffRecord::Copy {
            dest_offset: dest_offset as u32,
            chunk_index,
        });
    }

    pub fn copy_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, DiffRecord::Copy { .. }))
            .count()
    }

    pub fn literal_bytes(&self) -> usize {
        self.records
            .iter()
            .map(|r| match r {
                DiffRecord::Literal { data, .. } => data.len(),
                DiffRecord::Copy { .. } => 0,
            })
            .sum()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for record in &self.records {
            match record {
                DiffRecord::Literal { start, end, data } => {
                    buf.put_u8(LITERAL_TAG);
                    buf.put_u32(*start);
                    buf.put_u32(*end);
                    buf.put_slice(data);
                }
                DiffRecord::Copy {
                    dest_offset,
                    chunk_index,
                } => {
                    buf.put_u8(COPY_TAG);
                    buf.put_u32(*dest_offset);
                    buf.put_u32(*chunk_index);
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, DeltaError> {
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let tag = payload[offset];
            let mut fields = payload
                .get(offset + 1..offset + 9)
                .ok_or(DeltaError::TruncatedScript(offset))?;
            let a = fields.get_u32();
            let b = fields.get_u32();
            match tag {
                LITERAL_TAG => {
                    if b < a {
                        return Err(DeltaError::InvalidLiteralBounds { start: a, end: b });
                    }
                    let data_start = offset + 9;
                    let data_end = data_start + (b - a) as usize;
                    if data_end > payload.len() {
                        return Err(DeltaError::TruncatedScript(offset));
                    }
                    records.push(DiffRecord::Literal {
                        start: a,
                        end: b,
                        data: payload.slice(data_start..data_end),
                    });
                    offset = data_end;
                }
                COPY_TAG => {
                    records.push(DiffRecord::Copy {
                        dest_offset: a,
                        chunk_index: b,
                    });
                    offset += 9;
                }
                other => return Err(DeltaError::UnknownRecordTag { tag: other, offset }),
            }
        }
        Ok(Self { records })
    }
}

/// Diffs `local_path` against the reference described by `table`.
pub fn compute_diff(
    table: &ChecksumTable,
    local_path: &Path,
    block_size: usize,
) -> Result<DiffScript, DeltaError> {
    let len = fs::metadata(local_path)?.len();
    if len > u64::from(u32::MAX) {
        return Err(DeltaError::FileTooLarge(len));
    }
    let data = fs::read(local_path)?;
    Ok(diff_bytes(table, &data, block_size))
}

/// Scan `data` one byte at a time; whenever the window at the scan position
/// matches a reference block, emit the unmatched run as a literal, then a
/// copy, and jump past the block.
pub fn diff_bytes(table: &ChecksumTable, data: &[u8], block_size: usize) -> DiffScript {
    let buckets = table.buckets();
    let mut script = DiffScript::default();
    let mut pos = 0;
    let mut offset = 0;
    let mut window: Option<Rolling> = None;

    while !buckets.is_empty() && offset + block_size <= data.len() {
        let rolling = window.unwrap_or_else(|| Rolling::new(&data[offset..offset + block_size]));
        let block = &data[offset..offset + block_size];
        if let Some(chunk_index) = find_match(&buckets, rolling.digest(), block) {
            script.push_literal(pos, &data[pos..offset]);
            script.push_copy(offset, chunk_index);
            offset += block_size;
            pos = offset;
            window = None;
            continue;
        }
        window = if offset + block_size < data.len() {
            let mut next = rolling;
            next.roll(data[offset], data[offset + block_size]);
            Some(next)
        } else {
            None
        };
        offset += 1;
    }

    // The reference's last block is usually short; give the tail one chance
    // to match it.
    if !buckets.is_empty() && offset < data.len() {
        let tail = &data[offset..];
        if let Some(chunk_index) = find_match(&buckets, Rolling::new(tail).digest(), tail) {
            script.push_literal(pos, &data[pos..offset]);
            script.push_copy(offset, chunk_index);
            pos = data.len();
        }
    }
    script.push_literal(pos, &data[pos..]);
    script
}

fn find_match(
    buckets: &HashMap<u16, Vec<CheckSumRecord>>,
    rolling: u32,
    block: &[u8],
) -> Option<u32> {
    let candidates = buckets.get(&super::checksum::key_of(rolling))?;
    let mut hash: Option<[u8; HASH_LEN]> = None;
    candidates
        .iter()
        .filter(|c| c.rolling_checksum == rolling)
        .find(|c| *hash.get_or_insert_with(|| strong_hash(block)) == c.content_hash)
        .map(|c| c.chunk_index)
}

pub fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    target.with_file_name(name)
}

/// Replays `script` into a scratch file, reading copy blocks from the current
/// `target`, then renames the scratch file over `target`.
pub fn reconstruct(script: &DiffScript, target: &Path, block_size: usize) -> Result<(), DeltaError> {
    let scratch = temp_path(target);
    match replay(script, target, &scratch, block_size) {
        Ok(()) => {
            fs::rename(&scratch, target)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&scratch);
            Err(e)
        }
    }
}

fn replay(
    script: &DiffScript,
    reference: &Path,
    scratch: &Path,
    block_size: usize,
) -> Result<(), DeltaError> {
    let mut old = match File::open(reference) {
        Ok(file) => Some(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let old_len = match &old {
        Some(file) => file.metadata()?.len(),
        None => 0,
    };

    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(scratch)?;
    let mut block = vec![0u8; block_size];

    for record in &script.records {
        match record {
            DiffRecord::Literal { start, data, .. } => {
                out.seek(SeekFrom::Start(u64::from(*start)))?;
                out.write_all(data)?;
            }
            DiffRecord::Copy {
                dest_offset,
                chunk_index,
            } => {
                let begin = u64::from(*chunk_index) * block_size as u64;
                let file = match old.as_mut() {
                    Some(file) if begin < old_len => file,
                    _ => {
                        return Err(DeltaError::ChunkOutOfRange {
                            chunk_index: *chunk_index,
                            file_size: old_len,
                        })
                    }
                };
                let len = (old_len - begin).min(block_size as u64) as usize;
                file.seek(SeekFrom::Start(begin))?;
                file.read_exact(&mut block[..len])?;
                out.seek(SeekFrom::Start(u64::from(*dest_offset)))?;
                out.write_all(&block[..len])?;
            }
        }
    }
    out.sync_all()?;
    Ok(())
}
