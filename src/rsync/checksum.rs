//! Block checksums: the weak rolling sum and the 26-byte table records.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DeltaError;

/// `key(2) + chunk_index(4) + rolling_checksum(4) + content_hash(16)`
pub const RECORD_LEN: usize = 26;
pub const HASH_LEN: usize = 16;

/// Two-accumulator checksum: `s1` is the byte sum, `s2` the running sum of
/// `s1`. Bulk of the block is folded four bytes at a time.
pub fn rolling_checksum(block: &[u8]) -> u32 {
    let (s1, s2) = sums(block);
    combine(s1, s2)
}

fn sums(block: &[u8]) -> (u32, u32) {
    let mut s1: u32 = 0;
    let mut s2: u32 = 0;
    let mut quads = block.chunks_exact(4);
    for q in &mut quads {
        let (a, b, c, d) = (
            u32::from(q[0]),
            u32::from(q[1]),
            u32::from(q[2]),
            u32::from(q[3]),
        );
        s2 = s2
            .wrapping_add(s1.wrapping_add(a).wrapping_mul(4))
            .wrapping_add(3 * b + 2 * c + d);
        s1 = s1.wrapping_add(a + b + c + d);
    }
    for &byte in quads.remainder() {
        s1 = s1.wrapping_add(u32::from(byte));
        s2 = s2.wrapping_add(s1);
    }
    (s1, s2)
}

fn combine(s1: u32, s2: u32) -> u32 {
    (s1 & 0xffff) | (s2 << 16)
}

/// Hash-bucket selector: the high 16 bits of the rolling checksum.
pub fn key_of(rolling: u32) -> u16 {
    (rolling >> 16) as u16
}

/// 128-bit strong hash (BLAKE3 output prefix).
pub fn strong_hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&blake3::hash(data).as_bytes()[..HASH_LEN]);
    out
}

/// Rolling window state, slid one byte at a time in O(1).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rolling {
    s1: u32,
    s2: u32,
    len: u32,
}

impl Rolling {
    pub(crate) fn new(window: &[u8]) -> Self {
        let (s1, s2) = sums(window);
        Self {
            s1,
            s2,
            len: window.len() as u32,
        }
    }

    /// Drop `out` from the front of the window and append `incoming`.
    pub(crate) fn roll(&mut self, out: u8, incoming: u8) {
        let out = u32::from(out);
        self.s1 = self.s1.wrapping_sub(out).wrapping_add(u32::from(incoming));
        self.s2 = self
            .s2
            .wrapping_sub(self.len.wrapping_mul(out))
            .wrapping_add(self.s1);
    }

    pub(crate) fn digest(&self) -> u32 {
        combine(self.s1, self.s2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckSumRecord {
    pub key: u16,
    pub chunk_index: u32,
    pub rolling_checksum: u32,
    pub content_hash: [u8; HASH_LEN],
}

impl CheckSumRecord {
    pub fn for_block(chunk_index: u32, block: &[u8]) -> Self {
        let rolling_checksum = rolling_checksum(block);
        Self {
            key: key_of(rolling_checksum),
            chunk_index,
            rolling_checksum,
            content_hash: strong_hash(block),
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.key);
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.rolling_checksum);
        buf.put_slice(&self.content_hash);
    }

    fn decode(mut raw: &[u8]) -> Self {
        let key = raw.get_u16();
        let chunk_index = raw.get_u32();
        let rolling_checksum = raw.get_u32();
        let mut content_hash = [0u8; HASH_LEN];
        raw.copy_to_slice(&mut content_hash);
        Self {
            key,
            chunk_index,
            rolling_checksum,
            content_hash,
        }
    }
}

/// Checksums of every block of a reference file, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumTable {
    pub records: Vec<CheckSumRecord>,
}

impl ChecksumTable {
    pub fn from_bytes(data: &[u8], block_size: usize) -> Self {
        let records = data
            .chunks(block_size)
            .enumerate()
            .map(|(i, block)| CheckSumRecord::for_block(i as u32, block))
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.records.len() * RECORD_LEN);
        for record in &self.records {
            record.encode_into(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DeltaError> {
        if payload.len() % RECORD_LEN != 0 {
            return Err(DeltaError::InvalidTableLength(payload.len()));
        }
        let records = payload
            .chunks_exact(RECORD_LEN)
            .map(CheckSumRecord::decode)
            .collect();
        Ok(Self { records })
    }

    /// Groups records by key for average O(1) candidate lookup.
    pub fn buckets(&self) -> HashMap<u16, Vec<CheckSumRecord>> {
        let mut map: HashMap<u16, Vec<CheckSumRecord>> = HashMap::new();
        for record in &self.records {
            map.entry(record.key).or_default().push(*record);
        }
        map
    }
}

/// Reads `path` block by block; the final block may be short.
pub fn build_checksum_table(path: &Path, block_size: usize) -> Result<ChecksumTable, DeltaError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size > u64::from(u32::MAX) {
        return Err(DeltaError::FileTooLarge(size));
    }

    let mut records = Vec::with_capacity(size.div_ceil(block_size as u64) as usize);
    let mut block = vec![0u8; block_size];
    let mut chunk_index = 0u32;
    loop {
        let n = read_full(&mut file, &mut block)?;
        if n == 0 {
            break;
        }
        records.push(CheckSumRecord::for_block(chunk_index, &block[..n]));
        chunk_index += 1;
        if n < block_size {
            break;
        }
    }
    Ok(ChecksumTable { records })
}

/// Like `read_exact` but stops quietly at end of file.
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
