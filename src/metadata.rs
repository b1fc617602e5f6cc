use std::collections::HashMap;
use std::sync::Arc;

use crate::types::RawFrame;
use crate::{Result, SensorError};

/// Per-frame attribute a parser can extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    FrameCounter,
    FrameTimestamp,
    SensorTimestamp,
    ActualExposure,
    GainLevel,
    AutoExposure,
    ActualFps,
    BackendTimestamp,
}

/// Extracts one attribute from a raw frame's metadata.
pub trait MetadataParser: Send + Sync {
    fn supports(&self, frame: &RawFrame) -> bool;
    fn parse(&self, frame: &RawFrame) -> Result<i64>;
}

/// Little-endian unsigned field inside the metadata blob.
#[derive(Debug, Clone, Copy)]
pub struct FieldParser {
    offset: usize,
    width: usize,
}

impl FieldParser {
    /// `width` is the field size in bytes: 1, 2, 4 or 8.
    pub fn new(offset: usize, width: usize) -> Result<Self> {
        match width {
            1 | 2 | 4 | 8 => Ok(Self { offset, width }),
            other => Err(SensorError::InvalidArgument(format!(
                "unsupported metadata field width {}",
                other
            ))),
        }
    }
}

impl MetadataParser for FieldParser {
    fn supports(&self, frame: &RawFrame) -> bool {
        frame.metadata.len() >= self.offset + self.width
    }

    fn parse(&self, frame: &RawFrame) -> Result<i64> {
        let bytes = frame
            .metadata
            .get(self.offset..self.offset + self.width)
            .ok_or_else(|| {
                SensorError::InvalidArgument(format!(
                    "metadata of {} bytes has no field at {}..{}",
                    frame.metadata.len(),
                    self.offset,
                    self.offset + self.width
                ))
            })?;
        let mut buf = [0u8; 8];
        buf[..self.width].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf) as i64)
    }
}

/// Host capture time reported by the backend, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendTimeParser;

impl MetadataParser for BackendTimeParser {
    fn supports(&self, frame: &RawFrame) -> bool {
        frame.backend_time_ms > 0.0
    }

    fn parse(&self, frame: &RawFrame) -> Result<i64> {
        Ok(frame.backend_time_ms as i64)
    }
}

/// Registry of parsers keyed by metadata kind.
#[derive(Clone, Default)]
pub struct MetadataParserMap {
    parsers: HashMap<MetadataKind, Arc<dyn MetadataParser>>,
}

impl MetadataParserMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when a parser for `kind` was replaced.
    pub fn insert(&mut self, kind: MetadataKind, parser: Arc<dyn MetadataParser>) -> bool {
        self.parsers.insert(kind, parser).is_none()
    }

    pub fn contains(&self, kind: MetadataKind) -> bool {
        self.parsers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Run every supporting parser; individual parse failures are skipped.
    pub fn parse_all(&self, frame: &RawFrame) -> HashMap<MetadataKind, i64> {
        let mut out = HashMap::with_capacity(self.parsers.len());
        for (kind, parser) in &self.parsers {
            if !parser.supports(frame) {
                continue;
            }
            match parser.parse(frame) {
                Ok(value) => {
                    out.insert(*kind, value);
                }
                Err(e) => log::trace!("Metadata {:?} not parsed: {}", kind, e),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(metadata: Vec<u8>) -> RawFrame {
        RawFrame {
            pixels: vec![],
            metadata,
            backend_time_ms: 12.5,
        }
    }

    #[test]
    fn test_field_parser() {
        let parser = FieldParser::new(2, 4).unwrap();
        let frame = frame_with(vec![0xFF, 0xFF, 0x78, 0x56, 0x34, 0x12]);
        assert!(parser.supports(&frame));
        assert_eq!(parser.parse(&frame).unwrap(), 0x1234_5678);

        let short = frame_with(vec![0, 0, 1]);
        assert!(!parser.supports(&short));
        assert!(parser.parse(&short).is_err());
    }

    #[test]
    fn test_field_width_validated() {
        assert!(FieldParser::new(0, 3).is_err());
    }

    #[test]
    fn test_parse_all_skips_unsupported() {
        let mut map = MetadataParserMap::new();
        assert!(map.insert(MetadataKind::FrameCounter, Arc::new(FieldParser::new(0, 2).unwrap())));
        assert!(map.insert(MetadataKind::ActualExposure, Arc::new(FieldParser::new(8, 4).unwrap())));
        assert!(map.insert(MetadataKind::BackendTimestamp, Arc::new(BackendTimeParser)));

        let attrs = map.parse_all(&frame_with(vec![0x2A, 0x00, 0x01]));
        assert_eq!(attrs.get(&MetadataKind::FrameCounter), Some(&42));
        assert_eq!(attrs.get(&MetadataKind::BackendTimestamp), Some(&12));
        assert!(!attrs.contains_key(&MetadataKind::ActualExposure));
    }
}
