use std::fmt;

use crate::protocol::{Tag, SIGNATURE};
use crate::session::Role;

/// Framing failures that cannot be fixed by waiting for more bytes.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid signature {found:?}, expected {:?}", SIGNATURE)]
    InvalidSignature { found: [u8; 14] },
    #[error("chunk of tag {found} arrived while payload of tag {expected} was incomplete")]
    InterleavedPayload { expected: u16, found: u16 },
    #[error("is_final flag {0} is neither 51 nor 52")]
    InvalidFinalFlag(u32),
    #[error("payload of {len} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { len: usize, limit: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum table length {0} is not a multiple of 26")]
    InvalidTableLength(usize),
    #[error("diff script truncated at byte {0}")]
    TruncatedScript(usize),
    #[error("unknown diff record tag {tag:#04x} at byte {offset}")]
    UnknownRecordTag { tag: u8, offset: usize },
    #[error("literal record bounds {start}..{end} are inverted")]
    InvalidLiteralBounds { start: u32, end: u32 },
    #[error("copy of chunk {chunk_index} is outside the {file_size} byte reference file")]
    ChunkOutOfRange { chunk_index: u32, file_size: u64 },
    #[error("file of {0} bytes is too large for 32-bit diff offsets")]
    FileTooLarge(u64),
}

impl DeltaError {
    /// True when the input bytes themselves are corrupt, as opposed to a local
    /// filesystem failure.
    pub fn is_corruption(&self) -> bool {
        !matches!(self, DeltaError::Io(_) | DeltaError::FileTooLarge(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("unknown operation tag {0}")]
    UnknownOperation(u16),
    #[error("{tag:?} is not valid for the {role} role")]
    UnexpectedForRole { tag: Tag, role: Role },
    #[error("{0:?} received with no active transfer")]
    NoActiveTransfer(Tag),
    #[error("malformed {tag:?} payload: {reason}")]
    MalformedPayload { tag: Tag, reason: String },
    #[error("delta error: {0}")]
    Delta(#[from] DeltaError),
    #[error("{0:?} received before transfer parameters were negotiated")]
    NotNegotiated(Tag),
    #[error("invalid sync parameters: {0}")]
    InvalidParams(String),
    #[error("parameter encoding error: {0}")]
    Params(#[from] postcard::Error),
    #[error("an operation is already in flight")]
    OperationInFlight,
    #[error("no acknowledgement within {0} seconds")]
    AckTimeout(u64),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the connection must be torn down. Everything else is a local
    /// filesystem problem that gets reported to the peer and skipped.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Io(_) => false,
            SyncError::Delta(e) => e.is_corruption(),
            _ => true,
        }
    }

    pub fn malformed(tag: Tag, reason: impl Into<String>) -> Self {
        SyncError::MalformedPayload {
            tag,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn random() -> Self {
        ConnectionId(rand::random())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Terminal failure of one connection, with enough context to tell which side
/// gave up and on what.
#[derive(Debug)]
pub struct SessionError {
    pub connection: ConnectionId,
    pub role: Role,
    pub last_tag: Option<u16>,
    pub source: SyncError,
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} ({}) failed", self.connection, self.role)?;
        match self.last_tag.map(|raw| (raw, Tag::try_from(raw))) {
            Some((_, Ok(tag))) => write!(f, " after {tag:?}")?,
            Some((raw, Err(_))) => write!(f, " after tag {raw}")?,
            None => {}
        }
        write!(f, ": {}", self.source)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
