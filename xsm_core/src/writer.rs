use std::io::Write;

use log::{debug, trace};

use crate::crc64;
use crate::error::{Result, StructuredMessageError};
use crate::format::{
    encoded_len, segment_count, MessageHeader, SegmentHeader, FLAG_CRC64, MAX_SEGMENTS,
    MAX_SEGMENT_SIZE, VERSION,
};

/// How a payload is cut into segments when framing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingOptions {
    /// Payload bytes per segment (the last segment may be smaller).
    pub segment_size: usize,
    /// Emit per-segment CRC64 footers and the message trailer.
    pub crc64: bool,
}

impl Default for FramingOptions {
    fn default() -> Self {
        Self {
            segment_size: MAX_SEGMENT_SIZE,
            crc64: true,
        }
    }
}

impl FramingOptions {
    /// Check the options against a payload size and return the segment count.
    pub fn segments_for(&self, content_length: u64) -> Result<usize> {
        if self.segment_size == 0 {
            return Err(StructuredMessageError::InvalidSegmentCount {
                count: 0,
                reason: "segment size must be non-zero",
            });
        }
        if self.segment_size > MAX_SEGMENT_SIZE {
            return Err(StructuredMessageError::SegmentTooLarge {
                segment: 1,
                length: self.segment_size as u64,
            });
        }
        let count = segment_count(content_length, self.segment_size);
        if count > MAX_SEGMENTS {
            return Err(StructuredMessageError::InvalidSegmentCount {
                count,
                reason: "payload needs more than 65535 segments at this segment size",
            });
        }
        Ok(count)
    }
}

/// Sequential encoder for one structured message.
///
/// # Write contract
/// ```text
/// write_header(n, message_length, crc64)   exactly once, first
/// write_segment(data)                       exactly n times, in order
/// write_trailer()                           exactly once, last
/// ```
/// Any out-of-order call fails with [`StructuredMessageError::InvalidState`]
/// or [`StructuredMessageError::InvalidSegmentCount`]. Every error is fatal:
/// once a call has failed, all later writes fail with `InvalidState`.
pub struct StructuredMessageWriter<W: Write> {
    sink: W,
    header: Option<MessageHeader>,
    segments_written: usize,
    /// Running CRC64 over every segment payload written so far.
    total_crc64: u64,
    bytes_written: u64,
    closed: bool,
    failed: bool,
}

impl<W: Write> StructuredMessageWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            header: None,
            segments_written: 0,
            total_crc64: 0,
            bytes_written: 0,
            closed: false,
            failed: false,
        }
    }

    /// Emit the 13-byte header.
    ///
    /// `message_length` must be the full encoded size; [`encoded_len`]
    /// computes it. It is checked against the bytes actually written when the
    /// trailer goes out.
    pub fn write_header(
        &mut self,
        num_segments: usize,
        message_length: u64,
        enable_crc64: bool,
    ) -> Result<()> {
        self.check_usable()?;
        let result = self.emit_header(num_segments, message_length, enable_crc64);
        self.poison_on_err(result)
    }

    /// Emit the next segment: number, length, `data`, and its CRC64 if enabled.
    pub fn write_segment(&mut self, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let result = self.emit_segment(data);
        self.poison_on_err(result)
    }

    /// Emit the message trailer (nothing when CRC64 is disabled) and close the session.
    pub fn write_trailer(&mut self) -> Result<()> {
        self.check_usable()?;
        let result = self.emit_trailer();
        self.poison_on_err(result)
    }

    fn emit_header(
        &mut self,
        num_segments: usize,
        message_length: u64,
        enable_crc64: bool,
    ) -> Result<()> {
        if self.closed || self.header.is_some() {
            return Err(StructuredMessageError::InvalidState("header already written"));
        }
        if num_segments == 0 || num_segments > MAX_SEGMENTS {
            return Err(StructuredMessageError::InvalidSegmentCount {
                count: num_segments,
                reason: "segment count must be between 1 and 65535",
            });
        }

        let header = MessageHeader {
            version: VERSION,
            message_length,
            flags: if enable_crc64 { FLAG_CRC64 } else { 0 },
            num_segments: num_segments as u16,
        };
        self.emit(&header.to_bytes())?;
        self.header = Some(header);

        debug!(
            "structured message header written: {} segments, {} bytes, crc64={}",
            num_segments, message_length, enable_crc64
        );
        Ok(())
    }

    fn emit_segment(&mut self, data: &[u8]) -> Result<()> {
        let header = self.open_header()?;
        let number = self.segments_written + 1;

        if number > header.num_segments as usize {
            return Err(StructuredMessageError::InvalidSegmentCount {
                count: number,
                reason: "more segments than the header declared",
            });
        }
        if data.len() > MAX_SEGMENT_SIZE {
            return Err(StructuredMessageError::SegmentTooLarge {
                segment: number as u16,
                length: data.len() as u64,
            });
        }

        let segment = SegmentHeader {
            number: number as u16,
            data_length: data.len() as u64,
        };
        self.emit(&segment.to_bytes())?;
        self.emit(data)?;
        if header.crc64_enabled() {
            let crc = crc64::checksum(data);
            self.emit(&crc.to_le_bytes())?;
            trace!("segment {} written: {} bytes, crc64 {:016x}", number, data.len(), crc);
        } else {
            trace!("segment {} written: {} bytes", number, data.len());
        }

        self.total_crc64 = crc64::update(self.total_crc64, data);
        self.segments_written = number;
        Ok(())
    }

    fn emit_trailer(&mut self) -> Result<()> {
        let header = self.open_header()?;

        if self.segments_written != header.num_segments as usize {
            return Err(StructuredMessageError::InvalidSegmentCount {
                count: self.segments_written,
                reason: "trailer written before every declared segment",
            });
        }
        if header.crc64_enabled() {
            let crc = self.total_crc64;
            self.emit(&crc.to_le_bytes())?;
        }
        self.sink.flush()?;

        if self.bytes_written != header.message_length {
            return Err(StructuredMessageError::MessageLengthMismatch {
                declared: header.message_length,
                actual: self.bytes_written,
            });
        }
        self.closed = true;

        debug!(
            "structured message trailer written: {} bytes total, crc64 {:016x}",
            self.bytes_written, self.total_crc64
        );
        Ok(())
    }

    /// CRC64 over all segment payloads written so far.
    #[inline]
    pub fn total_crc64(&self) -> u64 {
        self.total_crc64
    }

    pub fn header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    pub fn segments_written(&self) -> usize {
        self.segments_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True once any call has failed; the session accepts no further writes.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Access the sink, e.g. to drain a `Vec<u8>` between segments.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    pub fn into_inner(self) -> W {
        self.sink
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

    fn open_header(&self) -> Result<MessageHeader> {
        if self.closed {
            return Err(StructuredMessageError::InvalidState("session already closed"));
        }
        self.header
            .ok_or(StructuredMessageError::InvalidState("header not written yet"))
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

/// Frame `payload` into a complete in-memory structured message.
pub fn encode(payload: &[u8], options: &FramingOptions) -> Result<Vec<u8>> {
    let content_length = payload.len() as u64;
    let num_segments = options.segments_for(content_length)?;
    let message_length = encoded_len(content_length, num_segments, options.crc64);

    let mut writer = StructuredMessageWriter::new(Vec::with_capacity(message_length as usize));
    writer.write_header(num_segments, message_length, options.crc64)?;
    if payload.is_empty() {
        writer.write_segment(&[])?;
    } else {
        for chunk in payload.chunks(options.segment_size) {
            writer.write_segment(chunk)?;
        }
    }
    writer.write_trailer()?;
    Ok(writer.into_inner())
}
