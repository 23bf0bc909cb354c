pub mod crc64;
pub mod error;
pub mod format;
pub mod reader;
pub mod writer;

pub use error::{ChecksumLocation, Result, StructuredMessageError};
pub use format::{encoded_len, segment_count, MessageHeader, SegmentHeader, HEADER_SIZE};
pub use reader::{decode, Segment, StructuredMessageReader};
pub use writer::{encode, FramingOptions, StructuredMessageWriter};
