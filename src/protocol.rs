//! Wire protocol: a fixed 24-byte header followed by the payload.
//!
//! ```text
//! offset 0:  signature      [14 bytes]
//! offset 14: tag            [2 bytes]
//! offset 16: payload_length [4 bytes]
//! offset 20: is_final       [4 bytes]  51 = final chunk, 52 = more follow
//! offset 24: payload
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

pub const SIGNATURE: [u8; 14] = *b"DirSyncProto01";
pub const HEADER_LEN: usize = 24;

pub const FINAL_CHUNK: u32 = 51;
pub const MORE_CHUNKS: u32 = 52;

/// Largest payload a single frame may carry. Both block sizes are capped at
/// this value, so a well-behaved peer never exceeds it.
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

/// Largest logical payload rejoined from several frames.
pub const MAX_ASSEMBLED_PAYLOAD: usize = 512 << 20;

/// Length of the whole-file digest carried by `SyncFileNotEmpty`.
pub const DIGEST_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    Done = 102,
    Init = 104,
    InitUploadList = 105,
    InitSyncConfig = 106,
    InitSyncFolder = 107,
    InitSyncFile = 108,
    InitFinished = 109,
    SyncFileEmpty = 110,
    SyncFileNotEmpty = 111,
    SyncFileDirect = 112,
    SyncFinished = 113,
    SyncGenerateDiff = 114,
    SyncReformFile = 115,
    OpRemove = 116,
    OpCreate = 117,
    OpModify = 118,
    OpRename = 119,
    OpMkdir = 120,
    SyncFailed = 122,
}

impl TryFrom<u16> for Tag {
    type Error = u16;

    fn try_from(raw: u16) -> Result<Self, u16> {
        let tag = match raw {
            102 => Tag::Done,
            104 => Tag::Init,
            105 => Tag::InitUploadList,
            106 => Tag::InitSyncConfig,
            107 => Tag::InitSyncFolder,
            108 => Tag::InitSyncFile,
            109 => Tag::InitFinished,
            110 => Tag::SyncFileEmpty,
            111 => Tag::SyncFileNotEmpty,
            112 => Tag::SyncFileDirect,
            113 => Tag::SyncFinished,
            114 => Tag::SyncGenerateDiff,
            115 => Tag::SyncReformFile,
            116 => Tag::OpRemove,
            117 => Tag::OpCreate,
            118 => Tag::OpModify,
            119 => Tag::OpRename,
            120 => Tag::OpMkdir,
            122 => Tag::SyncFailed,
            other => return Err(other),
        };
        Ok(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u16,
    pub payload_length: u32,
    pub is_final: bool,
}

impl Header {
    /// Decodes the first 24 bytes of `buf`. Returns `Ok(None)` if fewer are
    /// available.
    pub fn decode(buf: &[u8]) -> Result<Option<Header>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut found = [0u8; 14];
        found.copy_from_slice(&buf[..14]);
        if found != SIGNATURE {
            return Err(FrameError::InvalidSignature { found });
        }
        let mut rest = &buf[14..HEADER_LEN];
        let tag = rest.get_u16();
        let payload_length = rest.get_u32();
        let is_final = match rest.get_u32() {
            FINAL_CHUNK => true,
            MORE_CHUNKS => false,
            other => return Err(FrameError::InvalidFinalFlag(other)),
        };
        if payload_length as usize > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                len: payload_length as usize,
                limit: MAX_FRAME_PAYLOAD,
            });
        }
        Ok(Some(Header {
            tag,
            payload_length,
            is_final,
        }))
    }
}

/// One framed unit: a tag, its payload and the final-chunk flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u16,
    pub payload: Bytes,
    pub is_final: bool,
}

impl Message {
    pub fn new(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: tag as u16,
            payload: payload.into(),
            is_final: true,
        }
    }
}

pub fn encode(tag: u16, payload: &[u8], is_final: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&SIGNATURE);
    buf.put_u16(tag);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(if is_final { FINAL_CHUNK } else { MORE_CHUNKS });
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits one complete message off the front of `buffer`.
///
/// `Ok(None)` means more bytes are needed; the buffer is left untouched,
/// header included, so the caller just appends and calls again. A bad
/// header is terminal: there is no way to find the next frame boundary.
pub fn try_extract_one(buffer: &mut BytesMut) -> Result<Option<Message>, FrameError> {
    let Some(header) = Header::decode(buffer)? else {
        return Ok(None);
    };
    let total = HEADER_LEN + header.payload_length as usize;
    if buffer.len() < total {
        return Ok(None);
    }
    let mut frame = buffer.split_to(total);
    frame.advance(HEADER_LEN);
    Ok(Some(Message {
        tag: header.tag,
        payload: frame.freeze(),
        is_final: header.is_final,
    }))
}

/// Per-connection receive buffer.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        try_extract_one(&mut self.buf)
    }
}

/// Rejoins logical payloads that were split over several frames.
///
/// Frames with `is_final == false` are held until the final one arrives.
#[derive(Debug)]
pub struct PayloadAssembler {
    pending: Option<(u16, BytesMut)>,
    limit: usize,
}

impl Default for PayloadAssembler {
    fn default() -> Self {
        Self::with_limit(MAX_ASSEMBLED_PAYLOAD)
    }
}

impl PayloadAssembler {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: None,
            limit,
        }
    }

    pub fn push(&mut self, msg: Message) -> Result<Option<Message>, FrameError> {
        match self.pending.take() {
            None if msg.is_final => Ok(Some(msg)),
            None => {
                self.pending = Some((msg.tag, BytesMut::from(&msg.payload[..])));
                Ok(None)
            }
            Some((tag, _)) if tag != msg.tag => Err(FrameError::InterleavedPayload {
                expected: tag,
                found: msg.tag,
            }),
            Some((_, acc)) if acc.len() + msg.payload.len() > self.limit => {
                Err(FrameError::PayloadTooLarge {
                    len: acc.len() + msg.payload.len(),
                    limit: self.limit,
                })
            }
            Some((tag, mut acc)) => {
                acc.extend_from_slice(&msg.payload);
                if msg.is_final {
                    Ok(Some(Message {
                        tag,
                        payload: acc.freeze(),
                        is_final: true,
                    }))
                } else {
                    self.pending = Some((tag, acc));
                    Ok(None)
                }
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }
}

/// `[u32 len][new path][u32 len][old path]`
pub fn encode_rename(new_path: &str, old_path: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + new_path.len() + old_path.len());
    buf.put_u32(new_path.len() as u32);
    buf.put_slice(new_path.as_bytes());
    buf.put_u32(old_path.len() as u32);
    buf.put_slice(old_path.as_bytes());
    buf.freeze()
}

/// Returns `(new_path, old_path)`.
pub fn decode_rename(mut payload: &[u8]) -> Result<(String, String), String> {
    let new_path = take_prefixed(&mut payload)?;
    let old_path = take_prefixed(&mut payload)?;
    if payload.has_remaining() {
        return Err(format!("{} trailing bytes", payload.remaining()));
    }
    Ok((new_path, old_path))
}

fn take_prefixed(payload: &mut &[u8]) -> Result<String, String> {
    if payload.remaining() < 4 {
        return Err("missing length prefix".to_string());
    }
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        return Err(format!("path of {len} bytes truncated"));
    }
    let raw = payload[..len].to_vec();
    payload.advance(len);
    String::from_utf8(raw).map_err(|e| format!("path is not UTF-8: {e}"))
}

/// `SyncFileNotEmpty` payload: 16-byte digest followed by the relative path.
pub fn encode_probe(digest: &[u8; DIGEST_LEN], path: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(DIGEST_LEN + path.len());
    buf.put_slice(digest);
    buf.put_slice(path.as_bytes());
    buf.freeze()
}

pub fn decode_probe(payload: &[u8]) -> Result<([u8; DIGEST_LEN], String), String> {
    if payload.len() < DIGEST_LEN {
        return Err(format!("{} bytes is shorter than a digest", payload.len()));
    }
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&payload[..DIGEST_LEN]);
    let path = String::from_utf8(payload[DIGEST_LEN..].to_vec())
        .map_err(|e| format!("path is not UTF-8: {e}"))?;
    Ok((digest, path))
}
