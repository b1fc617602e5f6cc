//! # depth-sensor - streaming core for depth-camera sensors
//!
//! Sensor-level plumbing shared by UVC video and HID motion endpoints:
//! - Resolution of requested stream profiles against native device modes
//! - Open/start/stop/close lifecycle with all-or-nothing resource handling
//! - Reference-counted UVC power, HID stream multiplexing
//! - Per-frame timestamps, metadata attributes and notifications
//! - A `hidapi` transport for HID sensor-page devices (feature `hidapi`)
//!
//! ## Quick Start
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use depth_sensor::hidapi_backend::HidapiDevice;
//! use depth_sensor::{
//!     CustomReportTimestampReader, DeviceGraph, Format, Frame, HidSensor, HidStreamTables,
//!     IioTimestampReader, Sensor, SensorOptions, StreamKind, StreamProfile, SystemTimeService,
//! };
//!
//! let options = SensorOptions::from_env();
//! let device = HidapiDevice::enumerate(0x8086, 0x0b07, options.clone()).unwrap();
//! let time = Arc::new(SystemTimeService::new());
//! let gyro = StreamProfile::motion(StreamKind::Gyro, Format::MotionXyz32f, 200);
//! let tables = HidStreamTables {
//!     sensor_profiles: vec![("gyro_3d".into(), gyro)],
//!     sampling_frequencies: HashMap::from([(StreamKind::Gyro, HashMap::from([(200, 5)]))]),
//!     custom_sampling_frequencies: HashMap::new(),
//! };
//! let sensor = HidSensor::new(
//!     "motion",
//!     Arc::new(device),
//!     Box::new(IioTimestampReader::new(time.clone())),
//!     Box::new(CustomReportTimestampReader::new(time.clone())),
//!     tables,
//!     DeviceGraph::new(),
//!     options,
//!     time,
//! )
//! .unwrap();
//!
//! sensor.open(&[gyro]).unwrap();
//! sensor
//!     .start(Arc::new(|frame: Frame| {
//!         println!("{} @ {:.3} ms", frame.profile, frame.metadata.timestamp_ms)
//!     }))
//!     .unwrap();
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! sensor.stop().unwrap();
//! sensor.close().unwrap();
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod lazy;
pub mod request_mapper;
pub mod metadata;
pub mod time;
pub mod timestamp;
pub mod extrinsics;
pub mod notifications;
pub mod source;
pub mod backend;
pub mod power;
pub mod sensor;
pub mod uvc;
pub mod hid;
#[cfg(feature = "hidapi")]
pub mod hidapi_backend;

pub use error::SensorError;
pub use types::*;
pub use config::SensorOptions;
pub use lazy::Lazy;
pub use metadata::{MetadataKind, MetadataParser, MetadataParserMap};
pub use time::{SystemTimeService, TimeService};
pub use timestamp::{
    CustomReportTimestampReader, IioTimestampReader, TimestampReader, UvcTimestampReader,
};
pub use extrinsics::{DeviceGraph, Pose, SensorId};
pub use notifications::{Notification, NotificationCategory, NotificationsCallback, Severity};
pub use source::FrameCallback;
pub use backend::{HidDevice, UvcDevice};
pub use power::{PowerController, PowerGuard};
pub use sensor::{BeforeFrameCallback, Sensor, SensorBase};
pub use uvc::UvcSensor;
pub use hid::{HidSensor, HidStreamTables};

/// Result type alias for sensor operations.
pub type Result<T> = std::result::Result<T, SensorError>;
