/// Integration tests for the structured message Writer and Reader.
///
/// Covers the byte-exact "hello world" message, round trips at segment
/// boundaries, no-CRC mode, corruption detection, sequencing errors, and
/// sessions refusing further work after a failure.
use std::io::{self, Write};

use proptest::prelude::*;

use xsm_core::crc64;
use xsm_core::format::{
    encoded_len, MessageHeader, SegmentHeader, CRC64_SIZE, HEADER_SIZE, MAX_SEGMENT_SIZE,
    SEGMENT_HEADER_SIZE, VERSION,
};
use xsm_core::{
    decode, encode, ChecksumLocation, FramingOptions, StructuredMessageError,
    StructuredMessageReader, StructuredMessageWriter,
};

/// Generate `len` deterministic bytes using a simple LCG.
fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = seed;
    (0..len)
        .map(|_| {
            rng = rng
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (rng >> 56) as u8
        })
        .collect()
}

/// Frame `segments` verbatim, one writer call per entry.
fn frame_segments(segments: &[Vec<u8>], crc: bool) -> Vec<u8> {
    let content: u64 = segments.iter().map(|s| s.len() as u64).sum();
    let mut w = StructuredMessageWriter::new(Vec::new());
    w.write_header(segments.len(), encoded_len(content, segments.len(), crc), crc)
        .unwrap();
    for s in segments {
        w.write_segment(s).unwrap();
    }
    w.write_trailer().unwrap();
    w.into_inner()
}

fn small_options(segment_size: usize) -> FramingOptions {
    FramingOptions {
        segment_size,
        crc64: true,
    }
}

// ── byte layout ────────────────────────────────────────────────────────────

#[test]
fn test_hello_world_layout() {
    let payload = b"hello world";
    let message = encode(payload, &FramingOptions::default()).unwrap();
    assert_eq!(message.len(), 50);

    let header = MessageHeader::from_bytes(message[..HEADER_SIZE].try_into().unwrap()).unwrap();
    assert_eq!(header.version, VERSION);
    assert_eq!(header.message_length, 50);
    assert!(header.crc64_enabled());
    assert_eq!(header.num_segments, 1);

    let seg = SegmentHeader::from_bytes(message[13..23].try_into().unwrap());
    assert_eq!(seg.number, 1);
    assert_eq!(seg.data_length, 11);
    assert_eq!(&message[23..34], payload);

    let expected_crc = crc64::checksum(payload).to_le_bytes();
    assert_eq!(&message[34..42], &expected_crc, "segment crc64 follows the data");
    assert_eq!(&message[42..50], &expected_crc, "single-segment trailer equals segment crc");

    let mut r = StructuredMessageReader::new(message.as_slice());
    assert_eq!(r.read_all_segments().unwrap(), payload);
    assert_eq!(r.read_trailer().unwrap(), Some(crc64::checksum(payload)));
    assert!(r.is_closed());
}

// ── round trips ────────────────────────────────────────────────────────────

#[test]
fn test_roundtrip_across_segment_sizes() {
    let data = pseudo_random_bytes(10_000, 0xDEAD_BEEF);
    for segment_size in [1, 7, 1024, 4096, 9_999, 10_000, 10_001] {
        let message = encode(&data, &small_options(segment_size)).unwrap();
        let expected_segments = data.len().div_ceil(segment_size);
        let header =
            MessageHeader::from_bytes(message[..HEADER_SIZE].try_into().unwrap()).unwrap();
        assert_eq!(header.num_segments as usize, expected_segments);
        assert_eq!(decode(&message).unwrap(), data, "segment size {segment_size}");
    }
}

#[test]
fn test_empty_payload_is_one_empty_segment() {
    let message = encode(&[], &FramingOptions::default()).unwrap();
    assert_eq!(message.len() as u64, encoded_len(0, 1, true));
    assert!(decode(&message).unwrap().is_empty());

    let mut r = StructuredMessageReader::new(message.as_slice());
    let seg = r.read_segment().unwrap().unwrap();
    assert_eq!(seg.number, 1);
    assert!(seg.data.is_empty());
    assert_eq!(seg.crc64, Some(0));
    assert!(r.read_segment().unwrap().is_none());
    assert_eq!(r.read_trailer().unwrap(), Some(0));
}

#[test]
fn test_roundtrip_maximum_segment() {
    let data = pseudo_random_bytes(MAX_SEGMENT_SIZE, 7);
    let message = encode(&data, &FramingOptions::default()).unwrap();
    let header = MessageHeader::from_bytes(message[..HEADER_SIZE].try_into().unwrap()).unwrap();
    assert_eq!(header.num_segments, 1);
    assert_eq!(decode(&message).unwrap(), data);
}

#[test]
fn test_no_crc_mode_has_no_checksums() {
    let segments = vec![b"abc".to_vec(), b"defg".to_vec()];
    let message = frame_segments(&segments, false);

    // header + 2 segment headers + payload, nothing else
    assert_eq!(message.len(), HEADER_SIZE + 2 * SEGMENT_HEADER_SIZE + 7);

    let mut r = StructuredMessageReader::new(message.as_slice());
    let header = r.read_header().unwrap();
    assert!(!header.crc64_enabled());
    let first = r.read_segment().unwrap().unwrap();
    assert_eq!(first.crc64, None);
    assert_eq!(first.data, b"abc");
    assert_eq!(r.read_segment().unwrap().unwrap().data, b"defg");
    assert!(r.read_segment().unwrap().is_none());
    assert_eq!(r.read_trailer().unwrap(), None);
    assert_eq!(r.bytes_read(), message.len() as u64);
}

#[test]
fn test_writer_total_crc_matches_whole_payload() {
    let data = pseudo_random_bytes(5000, 99);
    let mut w = StructuredMessageWriter::new(Vec::new());
    w.write_header(5, encoded_len(5000, 5, true), true).unwrap();
    for chunk in data.chunks(1000) {
        w.write_segment(chunk).unwrap();
    }
    assert_eq!(w.total_crc64(), crc64::checksum(&data));
    w.write_trailer().unwrap();
    assert!(w.is_closed());

    let message = w.into_inner();
    let trailer = u64::from_le_bytes(message[message.len() - 8..].try_into().unwrap());
    assert_eq!(trailer, crc64::checksum(&data));
}

// ── corruption ─────────────────────────────────────────────────────────────

#[test]
fn test_every_single_bit_flip_is_detected() {
    let message = encode(b"hello world", &FramingOptions::default()).unwrap();
    // payload 23..34, segment crc 34..42, trailer 42..50
    for byte in 23..50 {
        for bit in 0..8 {
            let mut corrupted = message.clone();
            corrupted[byte] ^= 1 << bit;
            let err = decode(&corrupted).unwrap_err();
            let expected_location = if byte < 42 {
                ChecksumLocation::Segment(1)
            } else {
                ChecksumLocation::Message
            };
            match err {
                StructuredMessageError::Crc64Mismatch { location, .. } => {
                    assert_eq!(location, expected_location, "byte {byte} bit {bit}")
                }
                other => panic!("byte {byte} bit {bit}: expected Crc64Mismatch, got {other:?}"),
            }
        }
    }
}

#[test]
fn test_corruption_error_is_integrity_failure() {
    let mut message = encode(b"payload", &FramingOptions::default()).unwrap();
    message[HEADER_SIZE + SEGMENT_HEADER_SIZE] ^= 0x80;
    let err = decode(&message).unwrap_err();
    assert!(err.is_integrity_failure());
    assert!(err.to_string().contains("CRC64 mismatch in segment 1"), "{err}");
}

// ── sequencing ─────────────────────────────────────────────────────────────

#[test]
fn test_reordered_segments_fail_on_number_not_checksum() {
    let segments = vec![vec![1u8; 16], vec![2u8; 16], vec![3u8; 16]];
    let message = frame_segments(&segments, true);

    let block = SEGMENT_HEADER_SIZE + 16 + CRC64_SIZE;
    let second = HEADER_SIZE + block;
    let third = second + block;
    let mut reordered = message.clone();
    reordered[second..third].copy_from_slice(&message[third..third + block]);
    reordered[third..third + block].copy_from_slice(&message[second..third]);

    match decode(&reordered).unwrap_err() {
        StructuredMessageError::InvalidSegmentNumber { expected, found } => {
            assert_eq!((expected, found), (2, 3));
        }
        other => panic!("expected InvalidSegmentNumber, got {other:?}"),
    }
}

#[test]
fn test_duplicated_segment_number_is_rejected() {
    let segments = vec![vec![1u8; 4], vec![2u8; 4]];
    let mut message = frame_segments(&segments, true);
    let second = HEADER_SIZE + SEGMENT_HEADER_SIZE + 4 + CRC64_SIZE;
    message[second..second + 2].copy_from_slice(&1u16.to_le_bytes());

    assert!(matches!(
        decode(&message),
        Err(StructuredMessageError::InvalidSegmentNumber { expected: 2, found: 1 })
    ));
}

#[test]
fn test_declared_oversized_segment_is_rejected() {
    let mut message = MessageHeader {
        version: VERSION,
        message_length: 0,
        flags: 0,
        num_segments: 1,
    }
    .to_bytes()
    .to_vec();
    message.extend_from_slice(
        &SegmentHeader {
            number: 1,
            data_length: MAX_SEGMENT_SIZE as u64 + 1,
        }
        .to_bytes(),
    );

    let mut r = StructuredMessageReader::new(message.as_slice());
    assert!(matches!(
        r.read_segment(),
        Err(StructuredMessageError::SegmentTooLarge { segment: 1, .. })
    ));
}

#[test]
fn test_invalid_version_and_truncation() {
    let mut message = encode(b"data", &FramingOptions::default()).unwrap();

    let short = &message[..HEADER_SIZE - 1];
    assert!(matches!(
        StructuredMessageReader::new(short).read_header(),
        Err(StructuredMessageError::UnexpectedEof { field: "message header" })
    ));

    let truncated = &message[..message.len() - 3];
    assert!(matches!(
        decode(truncated),
        Err(StructuredMessageError::UnexpectedEof { field: "message trailer" })
    ));

    message[0] = 2;
    assert!(matches!(
        decode(&message),
        Err(StructuredMessageError::InvalidVersion { found: 2 })
    ));
}

#[test]
fn test_trailer_before_all_segments_is_rejected() {
    let message = encode(&pseudo_random_bytes(300, 1), &small_options(100)).unwrap();
    let mut r = StructuredMessageReader::new(message.as_slice());
    r.read_segment().unwrap().unwrap();
    assert!(matches!(
        r.read_trailer(),
        Err(StructuredMessageError::InvalidSegmentCount { count: 1, .. })
    ));
}

#[test]
fn test_reader_after_close_reports_eof() {
    let message = encode(b"abc", &FramingOptions::default()).unwrap();
    let mut r = StructuredMessageReader::new(message.as_slice());
    r.read_all_segments().unwrap();
    let crc = r.read_trailer().unwrap();
    assert!(r.read_segment().unwrap().is_none());
    assert_eq!(r.read_trailer().unwrap(), crc);
    r.close();
    r.close();
    assert!(r.is_closed());
}

#[test]
fn test_trailing_garbage_is_rejected() {
    let mut message = encode(b"abc", &FramingOptions::default()).unwrap();
    message.push(0);
    assert!(matches!(
        decode(&message),
        Err(StructuredMessageError::MessageLengthMismatch { .. })
    ));
}

// ── failed sessions ────────────────────────────────────────────────────────

#[test]
fn test_reader_refuses_to_continue_after_oversized_segment() {
    // Segment 1 claims 5 MiB; the bytes after its prefix happen to form a
    // valid 3-byte segment 1 that would satisfy the declared message length.
    let mut message = MessageHeader {
        version: VERSION,
        message_length: 36,
        flags: 0,
        num_segments: 1,
    }
    .to_bytes()
    .to_vec();
    message.extend_from_slice(
        &SegmentHeader {
            number: 1,
            data_length: 5 * 1024 * 1024,
        }
        .to_bytes(),
    );
    message.extend_from_slice(
        &SegmentHeader {
            number: 1,
            data_length: 3,
        }
        .to_bytes(),
    );
    message.extend_from_slice(b"abc");

    let mut r = StructuredMessageReader::new(message.as_slice());
    assert!(matches!(
        r.read_segment(),
        Err(StructuredMessageError::SegmentTooLarge { segment: 1, length: 5_242_880 })
    ));
    assert!(r.is_failed());
    assert!(matches!(
        r.read_segment(),
        Err(StructuredMessageError::InvalidState(_))
    ));
    assert!(matches!(
        r.read_trailer(),
        Err(StructuredMessageError::InvalidState(_))
    ));
    assert!(matches!(
        r.read_header(),
        Err(StructuredMessageError::InvalidState(_))
    ));
    assert!(!r.is_closed());
}

#[test]
fn test_reader_refuses_to_continue_after_checksum_mismatch() {
    let payload = pseudo_random_bytes(300, 5);
    let mut message = encode(&payload, &small_options(100)).unwrap();
    message[HEADER_SIZE + SEGMENT_HEADER_SIZE] ^= 0x01;

    let mut r = StructuredMessageReader::new(message.as_slice());
    assert!(matches!(
        r.read_segment(),
        Err(StructuredMessageError::Crc64Mismatch {
            location: ChecksumLocation::Segment(1),
            ..
        })
    ));
    assert!(matches!(
        r.read_segment(),
        Err(StructuredMessageError::InvalidState(_))
    ));
    assert!(matches!(
        r.read_all_segments(),
        Err(StructuredMessageError::InvalidState(_))
    ));
    assert!(matches!(
        r.read_trailer(),
        Err(StructuredMessageError::InvalidState(_))
    ));
    assert_eq!(r.segments_read(), 0);
}

/// A sink that accepts `budget` bytes and then fails every write.
struct FailingSink {
    written: Vec<u8>,
    budget: usize,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written.len() >= self.budget {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        let n = buf.len().min(self.budget - self.written.len());
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_writer_refuses_to_continue_after_sink_error() {
    let sink = FailingSink {
        written: Vec::new(),
        budget: HEADER_SIZE + 4,
    };
    let mut w = StructuredMessageWriter::new(sink);
    w.write_header(2, encoded_len(6, 2, true), true).unwrap();

    assert!(matches!(
        w.write_segment(b"abc"),
        Err(StructuredMessageError::Io(_))
    ));
    assert!(w.is_failed());

    // Freeing up the sink does not revive the session.
    w.get_mut().budget = usize::MAX;
    assert!(matches!(
        w.write_segment(b"abc"),
        Err(StructuredMessageError::InvalidState(_))
    ));
    assert!(matches!(
        w.write_trailer(),
        Err(StructuredMessageError::InvalidState(_))
    ));
    assert_eq!(w.segments_written(), 0);
    assert_eq!(w.into_inner().written.len(), HEADER_SIZE + 4);
}

// ── writer misuse ──────────────────────────────────────────────────────────

#[test]
fn test_writer_rejects_out_of_order_calls() {
    let mut w = StructuredMessageWriter::new(Vec::new());
    assert!(matches!(
        w.write_segment(b"x"),
        Err(StructuredMessageError::InvalidState(_))
    ));

    let mut w = StructuredMessageWriter::new(Vec::new());
    assert!(matches!(
        w.write_header(0, 0, true),
        Err(StructuredMessageError::InvalidSegmentCount { count: 0, .. })
    ));

    let mut w = StructuredMessageWriter::new(Vec::new());
    assert!(matches!(
        w.write_header(65_536, 0, true),
        Err(StructuredMessageError::InvalidSegmentCount { count: 65_536, .. })
    ));

    let mut w = StructuredMessageWriter::new(Vec::new());
    w.write_header(1, encoded_len(1, 1, true), true).unwrap();
    assert!(matches!(
        w.write_header(1, 0, true),
        Err(StructuredMessageError::InvalidState(_))
    ));

    let mut w = StructuredMessageWriter::new(Vec::new());
    w.write_header(1, encoded_len(1, 1, true), true).unwrap();
    assert!(matches!(
        w.write_trailer(),
        Err(StructuredMessageError::InvalidSegmentCount { count: 0, .. })
    ));

    let mut w = StructuredMessageWriter::new(Vec::new());
    w.write_header(1, encoded_len(1, 1, true), true).unwrap();
    assert!(matches!(
        w.write_segment(&vec![0u8; MAX_SEGMENT_SIZE + 1]),
        Err(StructuredMessageError::SegmentTooLarge { segment: 1, .. })
    ));

    let mut w = StructuredMessageWriter::new(Vec::new());
    w.write_header(1, encoded_len(1, 1, true), true).unwrap();
    w.write_segment(b"x").unwrap();
    assert!(matches!(
        w.write_segment(b"y"),
        Err(StructuredMessageError::InvalidSegmentCount { count: 2, .. })
    ));

    let mut w = StructuredMessageWriter::new(Vec::new());
    w.write_header(1, encoded_len(1, 1, true), true).unwrap();
    w.write_segment(b"x").unwrap();
    w.write_trailer().unwrap();
    assert!(w.is_closed());
    assert!(matches!(
        w.write_trailer(),
        Err(StructuredMessageError::InvalidState(_))
    ));
}

#[test]
fn test_writer_checks_declared_message_length() {
    let mut w = StructuredMessageWriter::new(Vec::new());
    w.write_header(1, 10, true).unwrap();
    w.write_segment(b"abc").unwrap();
    assert!(matches!(
        w.write_trailer(),
        Err(StructuredMessageError::MessageLengthMismatch { declared: 10, actual: 42 })
    ));
}

#[test]
fn test_framing_options_validation() {
    let zero = FramingOptions {
        segment_size: 0,
        crc64: true,
    };
    assert!(matches!(
        encode(b"abc", &zero),
        Err(StructuredMessageError::InvalidSegmentCount { count: 0, .. })
    ));

    let oversized = small_options(MAX_SEGMENT_SIZE + 1);
    assert!(matches!(
        encode(b"abc", &oversized),
        Err(StructuredMessageError::SegmentTooLarge { .. })
    ));

    assert!(matches!(
        small_options(1).segments_for(70_000),
        Err(StructuredMessageError::InvalidSegmentCount { count: 70_000, .. })
    ));
}

// ── properties ─────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_segments_roundtrip(
        segments in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..256), 1..12),
        crc in any::<bool>(),
    ) {
        let message = frame_segments(&segments, crc);
        let mut r = StructuredMessageReader::new(message.as_slice());
        let mut decoded = Vec::new();
        while let Some(seg) = r.read_segment().unwrap() {
            prop_assert_eq!(seg.number as usize, decoded.len() + 1);
            decoded.push(seg.data);
        }
        r.read_trailer().unwrap();
        prop_assert_eq!(decoded, segments);
    }

    #[test]
    fn prop_payload_bit_flip_is_crc_mismatch(
        data in proptest::collection::vec(any::<u8>(), 1..2048),
        pick in any::<usize>(),
        bit in 0u8..8,
    ) {
        let message = encode(&data, &small_options(512)).unwrap();
        let offset = pick % data.len();
        let segment = offset / 512;
        let within = offset % 512;
        let position = HEADER_SIZE
            + segment * (SEGMENT_HEADER_SIZE + 512 + CRC64_SIZE)
            + SEGMENT_HEADER_SIZE
            + within;

        let mut corrupted = message;
        corrupted[position] ^= 1 << bit;
        let is_mismatch = matches!(
            decode(&corrupted),
            Err(StructuredMessageError::Crc64Mismatch { .. })
        );
        prop_assert!(is_mismatch);
    }
}
