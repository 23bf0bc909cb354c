use std::fmt;
use std::io;

use thiserror::Error;

/// Which checksum failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumLocation {
    /// The footer of the given 1-based segment.
    Segment(u16),
    /// The message trailer covering every segment payload.
    Message,
}

impl fmt::Display for ChecksumLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumLocation::Segment(n) => write!(f, "segment {}", n),
            ChecksumLocation::Message => write!(f, "message trailer"),
        }
    }
}

/// Every way a structured message session can fail.
///
/// All of these are fatal to the session that produced them.
#[derive(Error, Debug)]
pub enum StructuredMessageError {
    #[error("unsupported structured message version {found}")]
    InvalidVersion { found: u8 },

    #[error("invalid segment count {count}: {reason}")]
    InvalidSegmentCount { count: usize, reason: &'static str },

    #[error("segment out of sequence: expected segment {expected}, got {found}")]
    InvalidSegmentNumber { expected: u16, found: u16 },

    #[error("segment {segment} is {length} bytes, above the 4 MiB limit")]
    SegmentTooLarge { segment: u16, length: u64 },

    #[error("CRC64 mismatch in {location}: expected {expected:016x}, computed {computed:016x}")]
    Crc64Mismatch {
        location: ChecksumLocation,
        expected: u64,
        computed: u64,
    },

    #[error("unexpected end of stream while reading {field}")]
    UnexpectedEof { field: &'static str },

    #[error("message length mismatch: header declares {declared} bytes but {actual} were framed")]
    MessageLengthMismatch { declared: u64, actual: u64 },

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StructuredMessageError>;

impl StructuredMessageError {
    /// True for failures that mean the payload bytes themselves are damaged.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, StructuredMessageError::Crc64Mismatch { .. })
    }
}

impl From<StructuredMessageError> for io::Error {
    fn from(err: StructuredMessageError) -> Self {
        match err {
            StructuredMessageError::Io(inner) => inner,
            e @ StructuredMessageError::UnexpectedEof { .. } => {
                io::Error::new(io::ErrorKind::UnexpectedEof, e)
            }
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}
