use std::fmt;

/// Format token announcing a structured message body.
pub const STRUCTURED_BODY_FORMAT: &str = "XSM/1.0";

/// Property token announcing CRC64 segment footers and trailer.
pub const CRC64_PROPERTY: &str = "crc64";

/// Request/response header carrying the body-type marker.
pub const STRUCTURED_BODY_HEADER: &str = "x-ms-structured-body";

/// Request header carrying the raw (unframed) payload length.
pub const STRUCTURED_CONTENT_LENGTH_HEADER: &str = "x-ms-structured-content-length";

/// Request header carrying a whole-body CRC64 for unframed uploads.
pub const CONTENT_CRC64_HEADER: &str = "x-ms-content-crc64";

/// Parsed body-type marker, e.g. `XSM/1.0; properties=crc64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredBodyType {
    pub crc64: bool,
}

impl StructuredBodyType {
    pub const CRC64: Self = Self { crc64: true };

    /// Parse a body-type marker.
    ///
    /// Returns `None` unless `value` starts with `XSM/1.0` (any case); such
    /// bodies are opaque bytes.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim_start();
        let prefix = value.get(..STRUCTURED_BODY_FORMAT.len())?;
        if !prefix.eq_ignore_ascii_case(STRUCTURED_BODY_FORMAT) {
            return None;
        }

        let crc64 = value
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .filter(|(key, _)| key.trim().eq_ignore_ascii_case("properties"))
            .flat_map(|(_, props)| props.split(','))
            .any(|prop| prop.trim().eq_ignore_ascii_case(CRC64_PROPERTY));

        Some(Self { crc64 })
    }
}

impl fmt::Display for StructuredBodyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.crc64 {
            write!(f, "{}; properties={}", STRUCTURED_BODY_FORMAT, CRC64_PROPERTY)
        } else {
            f.write_str(STRUCTURED_BODY_FORMAT)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_markers() {
        assert_eq!(
            StructuredBodyType::parse("XSM/1.0; properties=crc64"),
            Some(StructuredBodyType { crc64: true })
        );
        assert_eq!(
            StructuredBodyType::parse("xsm/1.0;PROPERTIES=other, CRC64"),
            Some(StructuredBodyType { crc64: true })
        );
        assert_eq!(
            StructuredBodyType::parse("XSM/1.0"),
            Some(StructuredBodyType { crc64: false })
        );
    }

    #[test]
    fn rejects_other_bodies() {
        assert_eq!(StructuredBodyType::parse(""), None);
        assert_eq!(StructuredBodyType::parse("XSM/2.0"), None);
        assert_eq!(StructuredBodyType::parse("application/octet-stream"), None);
        assert_eq!(StructuredBodyType::parse("XSM"), None);
    }

    #[test]
    fn display_round_trips() {
        for body_type in [StructuredBodyType::CRC64, StructuredBodyType { crc64: false }] {
            assert_eq!(
                StructuredBodyType::parse(&body_type.to_string()),
                Some(body_type)
            );
        }
        assert_eq!(StructuredBodyType::CRC64.to_string(), "XSM/1.0; properties=crc64");
    }
}
