use std::io::{self, Read, Seek, SeekFrom};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;

use xsm_core::crc64;
use xsm_core::format::MAX_SEGMENT_SIZE;
use xsm_core::{
    encoded_len, FramingOptions, Result, StructuredMessageError, StructuredMessageWriter,
};

use crate::body_type::{
    StructuredBodyType, CONTENT_CRC64_HEADER, STRUCTURED_BODY_HEADER,
    STRUCTURED_CONTENT_LENGTH_HEADER,
};

/// Payloads at or above this size are sent as structured messages; smaller
/// ones carry a single whole-body CRC64 header.
pub const STRUCTURED_MESSAGE_THRESHOLD: u64 = MAX_SEGMENT_SIZE as u64;

const CHECKSUM_BUFFER_SIZE: usize = 64 * 1024;

/// True when a payload of `content_length` bytes needs full framing.
#[inline]
pub fn uses_framing(content_length: u64) -> bool {
    content_length >= STRUCTURED_MESSAGE_THRESHOLD
}

/// Base64 of the little-endian CRC64 bytes, as transport headers expect it.
pub fn crc64_header_value(crc: u64) -> String {
    STANDARD.encode(crc.to_le_bytes())
}

/// The validation strategy picked for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferValidation {
    /// Unframed body with one precomputed CRC64.
    Inline { crc64: u64 },
    /// Structured message body.
    Framed {
        body_type: StructuredBodyType,
        content_length: u64,
        message_length: u64,
        num_segments: usize,
    },
}

impl TransferValidation {
    /// Header name/value pairs the transport must attach to the request.
    pub fn transport_headers(&self) -> Vec<(&'static str, String)> {
        match self {
            TransferValidation::Inline { crc64 } => {
                vec![(CONTENT_CRC64_HEADER, crc64_header_value(*crc64))]
            }
            TransferValidation::Framed {
                body_type,
                content_length,
                ..
            } => vec![
                (STRUCTURED_BODY_HEADER, body_type.to_string()),
                (STRUCTURED_CONTENT_LENGTH_HEADER, content_length.to_string()),
            ],
        }
    }
}

/// An upload body with its validation strategy already applied.
///
/// `Inline` hands back the source rewound to where it started, so the same
/// bytes go out after the checksum pass. `Framed` produces the structured
/// message incrementally as it is read.
pub enum UploadBody<R: Read> {
    Inline {
        source: R,
        crc64: u64,
        content_length: u64,
    },
    Framed(FramedUpload<R>),
}

impl<R: Read + Seek> UploadBody<R> {
    /// Select the strategy for the bytes between the source's current
    /// position and its end.
    pub fn prepare(source: R) -> Result<Self> {
        Self::with_segment_size(source, MAX_SEGMENT_SIZE)
    }

    /// Like [`prepare`](Self::prepare), but framed bodies use `segment_size`
    /// bytes per segment. The threshold itself does not move.
    pub fn with_segment_size(mut source: R, segment_size: usize) -> Result<Self> {
        let start = source.stream_position()?;
        let end = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(start))?;
        let content_length = end.saturating_sub(start);

        if !uses_framing(content_length) {
            let crc64 = checksum_source(&mut source)?;
            source.seek(SeekFrom::Start(start))?;
            debug!(
                "upload of {} bytes below threshold: inline crc64 {:016x}",
                content_length, crc64
            );
            return Ok(UploadBody::Inline {
                source,
                crc64,
                content_length,
            });
        }

        let options = FramingOptions {
            segment_size,
            crc64: true,
        };
        Ok(UploadBody::Framed(FramedUpload::new(
            source,
            content_length,
            options,
        )?))
    }
}

impl<R: Read> UploadBody<R> {
    pub fn validation(&self) -> TransferValidation {
        match self {
            UploadBody::Inline { crc64, .. } => TransferValidation::Inline { crc64: *crc64 },
            UploadBody::Framed(framed) => framed.validation(),
        }
    }

    /// Number of bytes this body will produce when read to the end.
    pub fn wire_length(&self) -> u64 {
        match self {
            UploadBody::Inline { content_length, .. } => *content_length,
            UploadBody::Framed(framed) => framed.message_length(),
        }
    }

    pub fn transport_headers(&self) -> Vec<(&'static str, String)> {
        self.validation().transport_headers()
    }
}

impl<R: Read> Read for UploadBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            UploadBody::Inline { source, .. } => source.read(buf),
            UploadBody::Framed(framed) => framed.read(buf),
        }
    }
}

fn checksum_source<R: Read>(source: &mut R) -> Result<u64> {
    let mut buf = vec![0u8; CHECKSUM_BUFFER_SIZE];
    let mut crc = 0u64;
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            return Ok(crc);
        }
        crc = crc64::update(crc, &buf[..n]);
    }
}

/// Streaming structured message encoder over a payload source.
///
/// Each refill pulls one segment from the source and runs it through a
/// [`StructuredMessageWriter`] whose sink is drained on every read; at most
/// one encoded segment is buffered at a time.
pub struct FramedUpload<R: Read> {
    source: R,
    writer: StructuredMessageWriter<Vec<u8>>,
    /// Encoded bytes not yet handed to the caller.
    pending: Vec<u8>,
    pos: usize,
    chunk: Vec<u8>,
    segment_size: usize,
    content_length: u64,
    remaining: u64,
    num_segments: usize,
    /// Set once framing fails; the source offset is no longer trustworthy.
    failed: bool,
}

impl<R: Read> FramedUpload<R> {
    /// Frame exactly `content_length` bytes from `source`.
    pub fn new(source: R, content_length: u64, options: FramingOptions) -> Result<Self> {
        let num_segments = options.segments_for(content_length)?;
        let message_length = encoded_len(content_length, num_segments, options.crc64);

        let mut writer = StructuredMessageWriter::new(Vec::new());
        writer.write_header(num_segments, message_length, options.crc64)?;
        let pending = std::mem::take(writer.get_mut());

        debug!(
            "upload of {} bytes framed as {} segments ({} bytes on the wire)",
            content_length, num_segments, message_length
        );
        Ok(Self {
            source,
            writer,
            pending,
            pos: 0,
            chunk: Vec::new(),
            segment_size: options.segment_size,
            content_length,
            remaining: content_length,
            num_segments,
            failed: false,
        })
    }

    pub fn validation(&self) -> TransferValidation {
        let header = self.writer.header();
        TransferValidation::Framed {
            body_type: StructuredBodyType {
                crc64: header.map_or(true, |h| h.crc64_enabled()),
            },
            content_length: self.content_length,
            message_length: self.message_length(),
            num_segments: self.num_segments,
        }
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn message_length(&self) -> u64 {
        self.writer.header().map_or(0, |h| h.message_length)
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// CRC64 of every payload byte framed so far; the full-body value once
    /// the body has been read to the end.
    pub fn total_crc64(&self) -> u64 {
        self.writer.total_crc64()
    }

    /// Encode the next segment (or the trailer) into `pending`.
    /// Returns `false` once the message is complete.
    fn refill(&mut self) -> Result<bool> {
        if self.writer.is_closed() {
            return Ok(false);
        }

        if self.writer.segments_written() < self.num_segments {
            let len = self.remaining.min(self.segment_size as u64) as usize;
            self.chunk.resize(len, 0);
            if let Err(e) = self.source.read_exact(&mut self.chunk) {
                return Err(match e.kind() {
                    io::ErrorKind::UnexpectedEof => StructuredMessageError::UnexpectedEof {
                        field: "upload source",
                    },
                    _ => e.into(),
                });
            }
            self.remaining -= len as u64;
            self.writer.write_segment(&self.chunk)?;
        } else {
            self.writer.write_trailer()?;
        }

        self.pending.clear();
        self.pos = 0;
        std::mem::swap(&mut self.pending, self.writer.get_mut());
        Ok(true)
    }
}

impl<R: Read> Read for FramedUpload<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                StructuredMessageError::InvalidState("structured upload already failed"),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pos);
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.refill() {
                Ok(true) => continue,
                Ok(false) => return Ok(0),
                Err(e) => {
                    self.failed = true;
                    return Err(e.into());
                }
            }
        }
    }
}
