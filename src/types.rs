use std::collections::HashMap;
use std::fmt;

use crate::metadata::MetadataKind;

/// Logical stream carried by a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Depth,
    Color,
    Infrared,
    Fisheye,
    Gyro,
    Accel,
    /// GPIO line 1..=4.
    Gpio(u8),
    Pose,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Depth => write!(f, "Depth"),
            StreamKind::Color => write!(f, "Color"),
            StreamKind::Infrared => write!(f, "Infrared"),
            StreamKind::Fisheye => write!(f, "Fisheye"),
            StreamKind::Gyro => write!(f, "Gyro"),
            StreamKind::Accel => write!(f, "Accel"),
            StreamKind::Gpio(line) => write!(f, "Gpio{}", line),
            StreamKind::Pose => write!(f, "Pose"),
        }
    }
}

/// Pixel or sample format as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Z16,
    Y8,
    Y16,
    Yuyv,
    Uyvy,
    Rgb8,
    Raw8,
    MotionXyz32f,
    GpioRaw,
    /// Matches any format registered for the stream.
    Any,
}

/// Four-character code, packed big-endian so `'GYRO'` reads left to right.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Fourcc(u32::from_be_bytes(*code))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({})", self)
    }
}

/// Origin of a frame timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    /// In-band hardware counter of the device.
    HardwareClock,
    /// Host-side capture clock.
    SystemTime,
}

/// A stream profile as requested by (or offered to) the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamProfile {
    pub stream: StreamKind,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamProfile {
    pub fn new(stream: StreamKind, format: Format, width: u32, height: u32, fps: u32) -> Self {
        Self { stream, format, width, height, fps }
    }

    /// Motion and GPIO streams carry no resolution.
    pub fn motion(stream: StreamKind, format: Format, fps: u32) -> Self {
        Self::new(stream, format, 0, 0, fps)
    }
}

impl fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {}x{}@{}",
            self.stream, self.format, self.width, self.height, self.fps
        )
    }
}

/// Backend-level stream configuration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub fourcc: Fourcc,
}

/// A stream configuration the physical device supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeProfile {
    pub stream: StreamKind,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Device-internal encoding.
    pub fourcc: Fourcc,
}

impl NativeProfile {
    pub fn backend_profile(&self) -> BackendProfile {
        BackendProfile {
            width: self.width,
            height: self.height,
            fps: self.fps,
            fourcc: self.fourcc,
        }
    }
}

/// Registered translation from a device encoding to application streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativePixelFormat {
    pub fourcc: Fourcc,
    pub bytes_per_pixel: u32,
    pub outputs: Vec<(StreamKind, Format)>,
}

impl NativePixelFormat {
    pub fn new(fourcc: Fourcc, bytes_per_pixel: u32, outputs: Vec<(StreamKind, Format)>) -> Self {
        Self { fourcc, bytes_per_pixel, outputs }
    }

    /// Whether this encoding can produce `format` on `stream`.
    pub fn provides(&self, stream: StreamKind, format: Format) -> bool {
        self.outputs
            .iter()
            .any(|&(s, f)| s == stream && (format == Format::Any || f == format))
    }
}

/// Binding of one accepted request to the native profile serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMapping {
    pub request: StreamProfile,
    pub native: NativeProfile,
    pub pixel_format: NativePixelFormat,
}

/// Raw buffer as handed over by a backend.
#[derive(Debug, Clone, Default)]
pub struct RawFrame {
    pub pixels: Vec<u8>,
    /// Device metadata blob (UVC payload header, HID timestamp field, ...).
    pub metadata: Vec<u8>,
    /// Host capture time in milliseconds, 0 when the backend has none.
    pub backend_time_ms: f64,
}

/// Per-frame timing produced by the active timestamp reader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetadata {
    pub timestamp_ms: f64,
    pub frame_number: u64,
    pub domain: ClockDomain,
    pub system_time_ms: f64,
}

/// A typed frame delivered to user callbacks.
#[derive(Debug, Clone)]
pub struct Frame {
    pub profile: StreamProfile,
    pub fourcc: Fourcc,
    pub data: Vec<u8>,
    pub metadata: FrameMetadata,
    pub attributes: HashMap<MetadataKind, i64>,
}

impl Frame {
    pub fn attribute(&self, kind: MetadataKind) -> Option<i64> {
        self.attributes.get(&kind).copied()
    }
}
