use std::io::{self, Read};

use log::{debug, error, warn};

use xsm_core::{MessageHeader, Result, StructuredMessageError, StructuredMessageReader};

use crate::body_type::StructuredBodyType;

/// A response body that strips structured message framing when the
/// body-type marker announces it, and passes bytes through untouched otherwise.
///
/// For framed bodies the trailer is validated before end-of-stream is
/// reported, so draining the body with `read` to `Ok(0)` proves the message
/// CRC64 matched. [`close`](ResponseBody::close) drains and validates
/// whatever the caller did not read; dropping the body does the same but can
/// only log a failure.
pub struct ResponseBody<R: Read> {
    body: Body<R>,
}

enum Body<R: Read> {
    Opaque(R),
    Structured(StructuredDecoder<R>),
}

impl<R: Read> ResponseBody<R> {
    /// Wrap `inner`. `body_type` is the value of the body-type marker, if the
    /// response carried one.
    pub fn new(inner: R, body_type: Option<&str>) -> Self {
        let body = match body_type.and_then(StructuredBodyType::parse) {
            Some(declared) => Body::Structured(StructuredDecoder::new(inner, declared)),
            None => Body::Opaque(inner),
        };
        Self { body }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self.body, Body::Structured(_))
    }

    /// The structured message header, once the first read has consumed it.
    pub fn message_header(&self) -> Option<&MessageHeader> {
        match &self.body {
            Body::Structured(decoder) => decoder.reader.header(),
            Body::Opaque(_) => None,
        }
    }

    /// The validated message CRC64, available once the trailer has been checked.
    pub fn content_crc64(&self) -> Option<u64> {
        match &self.body {
            Body::Structured(decoder) => match decoder.state {
                DecodeState::Done(crc) => crc,
                _ => None,
            },
            Body::Opaque(_) => None,
        }
    }

    /// Drain any unread segments, validate the trailer, and release the stream.
    ///
    /// Returns the validated message CRC64 (`None` for opaque bodies or
    /// messages without checksums).
    pub fn close(self) -> Result<Option<u64>> {
        match self.body {
            Body::Opaque(_) => Ok(None),
            Body::Structured(mut decoder) => decoder.finish(),
        }
    }
}

impl<R: Read> Read for ResponseBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.body {
            Body::Opaque(inner) => inner.read(buf),
            Body::Structured(decoder) => decoder.read(buf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Streaming,
    Done(Option<u64>),
    Failed,
}

struct StructuredDecoder<R: Read> {
    reader: StructuredMessageReader<R>,
    declared: StructuredBodyType,
    /// Payload of the current segment and how much of it has been served.
    segment: Vec<u8>,
    pos: usize,
    state: DecodeState,
}

impl<R: Read> StructuredDecoder<R> {
    fn new(inner: R, declared: StructuredBodyType) -> Self {
        Self {
            reader: StructuredMessageReader::new(inner),
            declared,
            segment: Vec::new(),
            pos: 0,
            state: DecodeState::Streaming,
        }
    }

    /// Load the next segment, or validate the trailer once none remain.
    /// Returns `false` at end of message.
    fn advance(&mut self) -> Result<bool> {
        if self.reader.header().is_none() {
            let header = self.reader.read_header()?;
            if header.crc64_enabled() != self.declared.crc64 {
                warn!(
                    "body type declares crc64={} but message flags are 0x{:04x}; following the message",
                    self.declared.crc64, header.flags
                );
            }
        }

        match self.reader.read_segment()? {
            Some(segment) => {
                self.segment = segment.data;
                self.pos = 0;
                Ok(true)
            }
            None => {
                let crc = self.reader.read_trailer()?;
                self.state = DecodeState::Done(crc);
                debug!(
                    "structured response fully validated: {} segments",
                    self.reader.segments_read()
                );
                Ok(false)
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state {
            DecodeState::Done(_) => return Ok(0),
            DecodeState::Failed => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    StructuredMessageError::InvalidState(
                        "structured response already failed validation",
                    ),
                ))
            }
            DecodeState::Streaming => {}
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.pos < self.segment.len() {
                let n = buf.len().min(self.segment.len() - self.pos);
                buf[..n].copy_from_slice(&self.segment[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => return Ok(0),
                Err(e) => {
                    self.state = DecodeState::Failed;
                    return Err(e.into());
                }
            }
        }
    }

    fn finish(&mut self) -> Result<Option<u64>> {
        loop {
            match self.state {
                DecodeState::Done(crc) => return Ok(crc),
                DecodeState::Failed => {
                    return Err(StructuredMessageError::InvalidState(
                        "structured response already failed validation",
                    ))
                }
                DecodeState::Streaming => {}
            }
            self.pos = self.segment.len();
            if let Err(e) = self.advance() {
                self.state = DecodeState::Failed;
                return Err(e);
            }
        }
    }
}

impl<R: Read> Drop for StructuredDecoder<R> {
    fn drop(&mut self) {
        if self.state != DecodeState::Streaming {
            return;
        }
        if let Err(e) = self.finish() {
            error!("structured response failed validation on drop: {}", e);
        }
    }
}
