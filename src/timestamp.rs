//! Per-frame timestamp, counter and clock-domain derivation.
//!
//! Three readers cover the supported hardware families:
//! - [`IioTimestampReader`]: HID samples carrying an in-band 64-bit
//!   microsecond counter in their metadata.
//! - [`CustomReportTimestampReader`]: vendor custom HID reports with the
//!   timestamp inside the report body.
//! - [`UvcTimestampReader`]: UVC payload header PTS, falling back to the
//!   host capture clock when the header carries none.

use std::collections::HashMap;
use std::sync::Arc;

use crate::time::TimeService;
use crate::types::{ClockDomain, FrameMetadata, RawFrame, RequestMapping, StreamKind};

const USEC_TO_MSEC: f64 = 0.001;

/// Byte offset of the microsecond timestamp inside a custom HID report.
pub const CUSTOM_TIMESTAMP_OFFSET: usize = 8;

/// Minimum UVC payload header length carrying a PTS.
const UVC_HEADER_WITH_PTS: usize = 6;

bitflags::bitflags! {
    /// `bmHeaderInfo` of a UVC payload header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UvcHeaderFlags: u8 {
        const FID = 1 << 0;
        const EOF = 1 << 1;
        const PTS = 1 << 2;
        const SCR = 1 << 3;
        const RES = 1 << 4;
        const STI = 1 << 5;
        const ERR = 1 << 6;
        const EOH = 1 << 7;
    }
}

/// Converts a raw frame's device metadata into normalized timing.
pub trait TimestampReader: Send {
    /// Timestamp in milliseconds.
    fn frame_timestamp(&mut self, mapping: &RequestMapping, frame: &RawFrame) -> f64;

    fn frame_counter(&mut self, mapping: &RequestMapping, frame: &RawFrame) -> u64;

    fn timestamp_domain(&self, mapping: &RequestMapping, frame: &RawFrame) -> ClockDomain;

    /// Forget all counters; called on every stream start.
    fn reset(&mut self);

    fn read(
        &mut self,
        mapping: &RequestMapping,
        frame: &RawFrame,
        system_time_ms: f64,
    ) -> FrameMetadata {
        FrameMetadata {
            timestamp_ms: self.frame_timestamp(mapping, frame),
            frame_number: self.frame_counter(mapping, frame),
            domain: self.timestamp_domain(mapping, frame),
            system_time_ms,
        }
    }
}

fn read_u64_le(bytes: &[u8], offset: usize) -> Option<u64> {
    let slice = bytes.get(offset..offset + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Some(u64::from_le_bytes(buf))
}

fn host_time(frame: &RawFrame, ts: &dyn TimeService) -> f64 {
    if frame.backend_time_ms > 0.0 {
        frame.backend_time_ms
    } else {
        ts.now_ms()
    }
}

/// Hardware-timer reader for standard HID motion samples.
pub struct IioTimestampReader {
    ts: Arc<dyn TimeService>,
    counters: HashMap<StreamKind, u64>,
}

impl IioTimestampReader {
    pub fn new(ts: Arc<dyn TimeService>) -> Self {
        Self {
            ts,
            counters: HashMap::new(),
        }
    }

    fn hardware_time(frame: &RawFrame) -> Option<u64> {
        read_u64_le(&frame.metadata, 0)
    }
}

impl TimestampReader for IioTimestampReader {
    fn frame_timestamp(&mut self, _mapping: &RequestMapping, frame: &RawFrame) -> f64 {
        match Self::hardware_time(frame) {
            Some(usec) => usec as f64 * USEC_TO_MSEC,
            None => host_time(frame, self.ts.as_ref()),
        }
    }

    fn frame_counter(&mut self, mapping: &RequestMapping, _frame: &RawFrame) -> u64 {
        let counter = self.counters.entry(mapping.request.stream).or_insert(0);
        *counter += 1;
        *counter
    }

    fn timestamp_domain(&self, _mapping: &RequestMapping, frame: &RawFrame) -> ClockDomain {
        if Self::hardware_time(frame).is_some() {
            ClockDomain::HardwareClock
        } else {
            ClockDomain::SystemTime
        }
    }

    fn reset(&mut self) {
        self.counters.clear();
    }
}

/// Reader for vendor custom HID reports lacking a standard counter channel.
pub struct CustomReportTimestampReader {
    ts: Arc<dyn TimeService>,
    counter: u64,
}

impl CustomReportTimestampReader {
    pub fn new(ts: Arc<dyn TimeService>) -> Self {
        Self { ts, counter: 0 }
    }
}

impl TimestampReader for CustomReportTimestampReader {
    fn frame_timestamp(&mut self, _mapping: &RequestMapping, frame: &RawFrame) -> f64 {
        match read_u64_le(&frame.pixels, CUSTOM_TIMESTAMP_OFFSET) {
            Some(usec) => usec as f64 * USEC_TO_MSEC,
            None => host_time(frame, self.ts.as_ref()),
        }
    }

    fn frame_counter(&mut self, _mapping: &RequestMapping, _frame: &RawFrame) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn timestamp_domain(&self, _mapping: &RequestMapping, frame: &RawFrame) -> ClockDomain {
        if read_u64_le(&frame.pixels, CUSTOM_TIMESTAMP_OFFSET).is_some() {
            ClockDomain::HardwareClock
        } else {
            ClockDomain::SystemTime
        }
    }

    fn reset(&mut self) {
        self.counter = 0;
    }
}

/// UVC payload-header reader with 32-bit PTS wraparound unwrapping.
pub struct UvcTimestampReader {
    ts: Arc<dyn TimeService>,
    clock_hz: f64,
    counter: u64,
    last_pts: Option<u32>,
    wraps: u64,
}

impl UvcTimestampReader {
    /// `clock_hz` is the device PTS clock rate in ticks per second.
    pub fn new(ts: Arc<dyn TimeService>, clock_hz: u32) -> Self {
        Self {
            ts,
            clock_hz: f64::from(clock_hz.max(1)),
            counter: 0,
            last_pts: None,
            wraps: 0,
        }
    }

    /// PTS of the payload header, if present and well formed.
    pub fn header_pts(metadata: &[u8]) -> Option<u32> {
        if metadata.len() < UVC_HEADER_WITH_PTS {
            return None;
        }
        let header_len = metadata[0] as usize;
        let flags = UvcHeaderFlags::from_bits_truncate(metadata[1]);
        if header_len < UVC_HEADER_WITH_PTS || !flags.contains(UvcHeaderFlags::PTS) {
            return None;
        }
        Some(u32::from_le_bytes([metadata[2], metadata[3], metadata[4], metadata[5]]))
    }

    fn unwrap_pts(&mut self, pts: u32) -> u64 {
        if let Some(last) = self.last_pts {
            // Only a backwards jump of more than half the range is a wrap.
            if pts < last && last - pts > u32::MAX / 2 {
                self.wraps += 1;
            }
        }
        self.last_pts = Some(pts);
        (self.wraps << 32) | u64::from(pts)
    }
}

impl TimestampReader for UvcTimestampReader {
    fn frame_timestamp(&mut self, _mapping: &RequestMapping, frame: &RawFrame) -> f64 {
        match Self::header_pts(&frame.metadata) {
            Some(pts) => self.unwrap_pts(pts) as f64 * 1000.0 / self.clock_hz,
            None => host_time(frame, self.ts.as_ref()),
        }
    }

    fn frame_counter(&mut self, _mapping: &RequestMapping, _frame: &RawFrame) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn timestamp_domain(&self, _mapping: &RequestMapping, frame: &RawFrame) -> ClockDomain {
        if Self::header_pts(&frame.metadata).is_some() {
            ClockDomain::HardwareClock
        } else {
            ClockDomain::SystemTime
        }
    }

    fn reset(&mut self) {
        self.counter = 0;
        self.last_pts = None;
        self.wraps = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Format, Fourcc, NativePixelFormat, NativeProfile, StreamProfile};

    struct FixedTime(f64);

    impl TimeService for FixedTime {
        fn now_ms(&self) -> f64 {
            self.0
        }
    }

    fn mapping(stream: StreamKind) -> RequestMapping {
        let fourcc = Fourcc::new(b"GYRO");
        RequestMapping {
            request: StreamProfile::motion(stream, Format::MotionXyz32f, 200),
            native: NativeProfile {
                stream,
                format: Format::MotionXyz32f,
                width: 0,
                height: 0,
                fps: 200,
                fourcc,
            },
            pixel_format: NativePixelFormat::new(fourcc, 1, vec![(stream, Format::MotionXyz32f)]),
        }
    }

    fn uvc_header(pts: u32) -> Vec<u8> {
        let mut md = vec![12, (UvcHeaderFlags::PTS | UvcHeaderFlags::EOF).bits()];
        md.extend_from_slice(&pts.to_le_bytes());
        md.extend_from_slice(&[0; 6]);
        md
    }

    #[test]
    fn test_iio_hardware_timestamp() {
        let mut reader = IioTimestampReader::new(Arc::new(FixedTime(5.0)));
        let m = mapping(StreamKind::Gyro);
        let frame = RawFrame {
            metadata: 2_500_000u64.to_le_bytes().to_vec(),
            ..Default::default()
        };
        let md = reader.read(&m, &frame, 1.0);
        assert!((md.timestamp_ms - 2500.0).abs() < 1e-9);
        assert_eq!(md.domain, ClockDomain::HardwareClock);
        assert_eq!(md.frame_number, 1);
    }

    #[test]
    fn test_iio_counters_per_stream_and_reset() {
        let mut reader = IioTimestampReader::new(Arc::new(FixedTime(5.0)));
        let gyro = mapping(StreamKind::Gyro);
        let accel = mapping(StreamKind::Accel);
        let frame = RawFrame::default();
        assert_eq!(reader.frame_counter(&gyro, &frame), 1);
        assert_eq!(reader.frame_counter(&gyro, &frame), 2);
        assert_eq!(reader.frame_counter(&accel, &frame), 1);
        reader.reset();
        assert_eq!(reader.frame_counter(&gyro, &frame), 1);
    }

    #[test]
    fn test_iio_falls_back_to_system_time() {
        let mut reader = IioTimestampReader::new(Arc::new(FixedTime(42.0)));
        let m = mapping(StreamKind::Accel);
        let frame = RawFrame::default();
        assert_eq!(reader.frame_timestamp(&m, &frame), 42.0);
        assert_eq!(reader.timestamp_domain(&m, &frame), ClockDomain::SystemTime);

        let stamped = RawFrame {
            backend_time_ms: 7.5,
            ..Default::default()
        };
        assert_eq!(reader.frame_timestamp(&m, &stamped), 7.5);
    }

    #[test]
    fn test_custom_report_timestamp() {
        let mut reader = CustomReportTimestampReader::new(Arc::new(FixedTime(0.0)));
        let m = mapping(StreamKind::Gpio(1));
        let mut report = vec![0u8; CUSTOM_TIMESTAMP_OFFSET];
        report.extend_from_slice(&1_000u64.to_le_bytes());
        let frame = RawFrame {
            pixels: report,
            ..Default::default()
        };
        assert_eq!(reader.frame_timestamp(&m, &frame), 1.0);
        assert_eq!(reader.timestamp_domain(&m, &frame), ClockDomain::HardwareClock);
    }

    #[test]
    fn test_uvc_header_pts() {
        assert_eq!(UvcTimestampReader::header_pts(&uvc_header(99)), Some(99));
        let mut no_pts = uvc_header(99);
        no_pts[1] = UvcHeaderFlags::EOF.bits();
        assert_eq!(UvcTimestampReader::header_pts(&no_pts), None);
        assert_eq!(UvcTimestampReader::header_pts(&[2, 0x04]), None);
    }

    #[test]
    fn test_uvc_pts_wraparound() {
        let mut reader = UvcTimestampReader::new(Arc::new(FixedTime(0.0)), 1_000_000);
        let m = mapping(StreamKind::Depth);
        let before = RawFrame {
            metadata: uvc_header(u32::MAX - 999),
            ..Default::default()
        };
        let after = RawFrame {
            metadata: uvc_header(1_000),
            ..Default::default()
        };
        let t0 = reader.frame_timestamp(&m, &before);
        let t1 = reader.frame_timestamp(&m, &after);
        assert!((t1 - t0 - 2.0).abs() < 1e-6, "t0={} t1={}", t0, t1);

        reader.reset();
        let t2 = reader.frame_timestamp(&m, &after);
        assert!((t2 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_uvc_system_fallback() {
        let mut reader = UvcTimestampReader::new(Arc::new(FixedTime(3.0)), 1_000_000);
        let m = mapping(StreamKind::Depth);
        let frame = RawFrame {
            metadata: vec![2, 0],
            ..Default::default()
        };
        let md = reader.read(&m, &frame, 3.0);
        assert_eq!(md.timestamp_ms, 3.0);
        assert_eq!(md.domain, ClockDomain::SystemTime);
    }
}
