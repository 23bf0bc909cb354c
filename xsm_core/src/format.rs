use crate::error::{Result, StructuredMessageError};

/// The only structured message version this crate reads or writes.
pub const VERSION: u8 = 1;

/// Fixed size of the message header in bytes.
///   version:u8 + message_length:u64 + flags:u16 + num_segments:u16
///   = 1 + 8 + 2 + 2 = 13
pub const HEADER_SIZE: usize = 13;

/// Size of the fixed part of each segment, in bytes.
///   segment_number:u16 + data_length:u64 = 10
///
/// The optional segment CRC64 follows the data, not this header.
pub const SEGMENT_HEADER_SIZE: usize = 10;

/// Size of a CRC64 value on the wire (segment footer and message trailer).
pub const CRC64_SIZE: usize = 8;

/// Size of the message trailer when CRC64 is enabled.
pub const TRAILER_SIZE: usize = CRC64_SIZE;

/// Largest payload a single segment may carry: 4 MiB.
pub const MAX_SEGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Largest segment count representable in the header.
pub const MAX_SEGMENTS: usize = u16::MAX as usize;

// ── Flags ──────────────────────────────────────────────────────────────────

/// Every segment carries a CRC64 footer and the message ends with a CRC64 trailer.
pub const FLAG_CRC64: u16 = 1 << 0;

// ── Header ─────────────────────────────────────────────────────────────────

/// Decoded representation of the 13-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    /// Total encoded size of the message, framing included.
    pub message_length: u64,
    pub flags: u16,
    pub num_segments: u16,
}

impl MessageHeader {
    /// Serialize to exactly `HEADER_SIZE` bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1..9].copy_from_slice(&self.message_length.to_le_bytes());
        buf[9..11].copy_from_slice(&self.flags.to_le_bytes());
        buf[11..13].copy_from_slice(&self.num_segments.to_le_bytes());
        buf
    }

    /// Deserialize from `HEADER_SIZE` bytes, checking version and segment count.
    ///
    /// Unknown flag bits are carried through untouched.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let header = Self {
            version: buf[0],
            message_length: u64::from_le_bytes(le_array(&buf[1..9])),
            flags: u16::from_le_bytes(le_array(&buf[9..11])),
            num_segments: u16::from_le_bytes(le_array(&buf[11..13])),
        };

        if header.version != VERSION {
            return Err(StructuredMessageError::InvalidVersion {
                found: header.version,
            });
        }
        if header.num_segments == 0 {
            return Err(StructuredMessageError::InvalidSegmentCount {
                count: 0,
                reason: "header declares no segments",
            });
        }
        Ok(header)
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn crc64_enabled(&self) -> bool {
        self.has_flag(FLAG_CRC64)
    }
}

// ── Segment header ─────────────────────────────────────────────────────────

/// The fixed 10-byte prefix of every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// 1-based position of the segment within the message.
    pub number: u16,
    pub data_length: u64,
}

impl SegmentHeader {
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.number.to_le_bytes());
        buf[2..10].copy_from_slice(&self.data_length.to_le_bytes());
        buf
    }

    /// Layout only; sequencing and size limits are checked by the reader.
    pub fn from_bytes(buf: &[u8; SEGMENT_HEADER_SIZE]) -> Self {
        Self {
            number: u16::from_le_bytes(le_array(&buf[0..2])),
            data_length: u64::from_le_bytes(le_array(&buf[2..10])),
        }
    }
}

#[inline]
fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

// ── Sizing helpers ─────────────────────────────────────────────────────────

/// Number of segments needed to carry `content_length` bytes in chunks of
/// `segment_size`. An empty payload still travels as one empty segment.
pub fn segment_count(content_length: u64, segment_size: usize) -> usize {
    if content_length == 0 || segment_size == 0 {
        return 1;
    }
    content_length.div_ceil(segment_size as u64) as usize
}

/// Exact encoded size of a message carrying `content_length` payload bytes
/// split over `num_segments` segments.
///
/// This is the value the writer expects as `message_length`.
pub fn encoded_len(content_length: u64, num_segments: usize, crc64: bool) -> u64 {
    let per_segment = SEGMENT_HEADER_SIZE + if crc64 { CRC64_SIZE } else { 0 };
    let trailer = if crc64 { TRAILER_SIZE } else { 0 };
    HEADER_SIZE as u64
        + num_segments as u64 * per_segment as u64
        + content_length
        + trailer as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let header = MessageHeader {
            version: VERSION,
            message_length: 0x0102_0304_0506_0708,
            flags: FLAG_CRC64,
            num_segments: 0x0A0B,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes, [1, 8, 7, 6, 5, 4, 3, 2, 1, 1, 0, 0x0B, 0x0A]);
        assert_eq!(MessageHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn header_rejects_bad_version_and_zero_segments() {
        let mut bytes = MessageHeader {
            version: VERSION,
            message_length: 50,
            flags: 0,
            num_segments: 1,
        }
        .to_bytes();

        bytes[0] = 2;
        assert!(matches!(
            MessageHeader::from_bytes(&bytes),
            Err(StructuredMessageError::InvalidVersion { found: 2 })
        ));

        bytes[0] = VERSION;
        bytes[11] = 0;
        assert!(matches!(
            MessageHeader::from_bytes(&bytes),
            Err(StructuredMessageError::InvalidSegmentCount { count: 0, .. })
        ));
    }

    #[test]
    fn unknown_flags_are_accepted() {
        let bytes = MessageHeader {
            version: VERSION,
            message_length: 13,
            flags: 0x8002,
            num_segments: 1,
        }
        .to_bytes();
        let header = MessageHeader::from_bytes(&bytes).unwrap();
        assert!(!header.crc64_enabled());
        assert_eq!(header.flags, 0x8002);
    }

    #[test]
    fn sizing_helpers() {
        assert_eq!(segment_count(0, MAX_SEGMENT_SIZE), 1);
        assert_eq!(segment_count(1, MAX_SEGMENT_SIZE), 1);
        assert_eq!(segment_count(MAX_SEGMENT_SIZE as u64, MAX_SEGMENT_SIZE), 1);
        assert_eq!(segment_count(MAX_SEGMENT_SIZE as u64 + 1, MAX_SEGMENT_SIZE), 2);

        // "hello world": 13 + 10 + 11 + 8 + 8
        assert_eq!(encoded_len(11, 1, true), 50);
        assert_eq!(encoded_len(11, 1, false), 34);
    }
}
