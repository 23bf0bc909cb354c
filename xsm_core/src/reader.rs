use std::io::{self, Read};

use log::{debug, trace};

use crate::crc64;
use crate::error::{ChecksumLocation, Result, StructuredMessageError};
use crate::format::{
    MessageHeader, SegmentHeader, CRC64_SIZE, HEADER_SIZE, MAX_SEGMENT_SIZE, SEGMENT_HEADER_SIZE,
};

/// One validated segment as returned by [`StructuredMessageReader::read_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub number: u16,
    pub data: Vec<u8>,
    /// The segment's own CRC64 footer, when the message carries checksums.
    pub crc64: Option<u64>,
}

/// Sequential decoder and validator for one structured message.
///
/// # Read sequence
/// 1. [`read_header`] (cached; later calls return the same header).
/// 2. [`read_segment`] until it returns `Ok(None)`. Segment numbers must run
///    1, 2, 3... without gaps; each payload is checked against its CRC64
///    footer when the header's CRC64 flag is set.
/// 3. [`read_trailer`] checks the message CRC64 against the running value
///    and closes the session.
///
/// Once closed, reads report end-of-message instead of failing. Every error is
/// fatal: after a failed call the stream position is undefined, so all later
/// reads fail with [`StructuredMessageError::InvalidState`].
///
/// [`read_header`]: StructuredMessageReader::read_header
/// [`read_segment`]: StructuredMessageReader::read_segment
/// [`read_trailer`]: StructuredMessageReader::read_trailer
pub struct StructuredMessageReader<R: Read> {
    source: R,
    header: Option<MessageHeader>,
    /// Number the next segment must carry; starts at 1.
    next_segment: usize,
    total_crc64: u64,
    trailer_crc64: Option<u64>,
    bytes_read: u64,
    closed: bool,
    failed: bool,
}

impl<R: Read> StructuredMessageReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            header: None,
            next_segment: 1,
            total_crc64: 0,
            trailer_crc64: None,
            bytes_read: 0,
            closed: false,
            failed: false,
        }
    }

    /// Read and validate the 13-byte header. Idempotent.
    pub fn read_header(&mut self) -> Result<MessageHeader> {
        self.check_usable()?;
        if let Some(header) = self.header {
            return Ok(header);
        }
        let result = self.parse_header();
        self.poison_on_err(result)
    }

    /// Read the next segment, or `Ok(None)` once every declared segment has
    /// been consumed (or the session is closed).
    pub fn read_segment(&mut self) -> Result<Option<Segment>> {
        self.check_usable()?;
        if self.closed {
            return Ok(None);
        }
        let result = self.parse_segment();
        self.poison_on_err(result)
    }

    /// Read every remaining segment and return their payloads concatenated.
    pub fn read_all_segments(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        while let Some(segment) = self.read_segment()? {
            payload.extend_from_slice(&segment.data);
        }
        Ok(payload)
    }

    /// Validate the message trailer and close the session.
    ///
    /// Returns the validated message CRC64, or `None` when the message
    /// carries no checksums. Calling it again after close returns the same value.
    pub fn read_trailer(&mut self) -> Result<Option<u64>> {
        self.check_usable()?;
        if self.closed {
            return Ok(self.trailer_crc64);
        }
        let result = self.parse_trailer();
        self.poison_on_err(result)
    }

    fn parse_header(&mut self) -> Result<MessageHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        self.fill(&mut buf, "message header")?;
        let header = MessageHeader::from_bytes(&buf)?;
        self.header = Some(header);

        debug!(
            "structured message header read: {} segments, {} bytes, flags 0x{:04x}",
            header.num_segments, header.message_length, header.flags
        );
        Ok(header)
    }

    fn parse_segment(&mut self) -> Result<Option<Segment>> {
        let header = self.read_header()?;
        if self.next_segment > header.num_segments as usize {
            return Ok(None);
        }
        let expected = self.next_segment as u16;

        let mut prefix = [0u8; SEGMENT_HEADER_SIZE];
        self.fill(&mut prefix, "segment header")?;
        let segment = SegmentHeader::from_bytes(&prefix);

        if segment.number != expected {
            return Err(StructuredMessageError::InvalidSegmentNumber {
                expected,
                found: segment.number,
            });
        }
        if segment.data_length > MAX_SEGMENT_SIZE as u64 {
            return Err(StructuredMessageError::SegmentTooLarge {
                segment: segment.number,
                length: segment.data_length,
            });
        }

        let mut data = vec![0u8; segment.data_length as usize];
        self.fill(&mut data, "segment data")?;

        let crc64 = if header.crc64_enabled() {
            let mut footer = [0u8; CRC64_SIZE];
            self.fill(&mut footer, "segment crc64")?;
            let expected_crc = u64::from_le_bytes(footer);
            let computed = crc64::checksum(&data);
            if computed != expected_crc {
                return Err(StructuredMessageError::Crc64Mismatch {
                    location: ChecksumLocation::Segment(segment.number),
                    expected: expected_crc,
                    computed,
                });
            }
            Some(expected_crc)
        } else {
            None
        };

        self.total_crc64 = crc64::update(self.total_crc64, &data);
        self.next_segment += 1;
        trace!("segment {} read: {} bytes", segment.number, data.len());

        Ok(Some(Segment {
            number: segment.number,
            data,
            crc64,
        }))
    }

    fn parse_trailer(&mut self) -> Result<Option<u64>> {
        let header = self.read_header()?;

        let consumed = self.next_segment - 1;
        if consumed != header.num_segments as usize {
            return Err(StructuredMessageError::InvalidSegmentCount {
                count: consumed,
                reason: "trailer read before every declared segment",
            });
        }

        if header.crc64_enabled() {
            let mut trailer = [0u8; CRC64_SIZE];
            self.fill(&mut trailer, "message trailer")?;
            let expected = u64::from_le_bytes(trailer);
            if expected != self.total_crc64 {
                return Err(StructuredMessageError::Crc64Mismatch {
                    location: ChecksumLocation::Message,
                    expected,
                    computed: self.total_crc64,
                });
            }
            self.trailer_crc64 = Some(expected);
        }

        if self.bytes_read != header.message_length {
            return Err(StructuredMessageError::MessageLengthMismatch {
                declared: header.message_length,
                actual: self.bytes_read,
            });
        }
        self.closed = true;

        debug!(
            "structured message trailer validated: {} segments, crc64 {:016x}",
            consumed, self.total_crc64
        );
        Ok(self.trailer_crc64)
    }

    /// Mark the session closed without further validation. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    /// Running CRC64 over every segment payload read so far.
    pub fn total_crc64(&self) -> u64 {
        self.total_crc64
    }

    pub fn segments_read(&self) -> usize {
        self.next_segment - 1
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once any read has failed; the session accepts no further reads.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(StructuredMessageError::InvalidState(
                "structured message session already failed",
            ));
        }
        Ok(())
    }

    fn poison_on_err<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn fill(&mut self, buf: &mut [u8], field: &'static str) -> Result<()> {
        match self.source.read_exact(buf) {
            Ok(()) => {
                self.bytes_read += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(StructuredMessageError::UnexpectedEof { field })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Validate a complete in-memory structured message and return its payload.
///
/// Bytes left over after the trailer are reported as a length mismatch.
pub fn decode(message: &[u8]) -> Result<Vec<u8>> {
    let mut reader = StructuredMessageReader::new(message);
    reader.read_header()?;
    let payload = reader.read_all_segments()?;
    reader.read_trailer()?;

    let consumed = reader.bytes_read();
    if consumed != message.len() as u64 {
        return Err(StructuredMessageError::MessageLengthMismatch {
            declared: consumed,
            actual: message.len() as u64,
        });
    }
    Ok(payload)
}
