//! Transport-level collaborators consumed by the sensors.
//!
//! A backend enumerates native profiles, opens and closes streams, delivers
//! raw buffers on its own capture thread and switches device power. The
//! `hidapi` feature provides a HID implementation in
//! [`crate::hidapi_backend`]; UVC transports are supplied by the embedder.

use std::sync::Arc;

use crate::types::{BackendProfile, RawFrame, StreamKind};
use crate::Result;

/// Called on the backend capture thread for every raw UVC buffer.
pub type RawFrameCallback = Arc<dyn Fn(BackendProfile, RawFrame) + Send + Sync>;

/// Called on the backend capture thread for every HID report.
pub type HidCallback = Arc<dyn Fn(HidSample) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Fully powered.
    D0,
    /// Suspended.
    D3,
}

/// Vendor control block of a UVC device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionUnit {
    pub subdevice: u8,
    pub unit: u8,
    pub node: u8,
    /// 16-byte GUID of the unit.
    pub id: [u8; 16],
}

/// Standard UVC processing-unit controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PuOption {
    Brightness,
    Contrast,
    Gain,
    Gamma,
    Hue,
    Saturation,
    Sharpness,
    WhiteBalance,
    EnableAutoWhiteBalance,
    BacklightCompensation,
    PowerLineFrequency,
    Exposure,
    EnableAutoExposure,
}

pub trait UvcDevice: Send + Sync {
    fn stream_profiles(&self) -> Result<Vec<BackendProfile>>;

    /// Negotiate `profile` and install the raw frame callback for it.
    fn probe_and_commit(&self, profile: BackendProfile, callback: RawFrameCallback) -> Result<()>;

    /// Allocate transfer resources for every committed profile.
    fn stream_on(&self) -> Result<()>;

    fn start_callbacks(&self);

    /// Returns once no callback is running and none will start.
    fn stop_callbacks(&self);

    fn close(&self, profile: BackendProfile) -> Result<()>;

    fn set_power_state(&self, state: PowerState) -> Result<()>;

    fn init_xu(&self, xu: &ExtensionUnit) -> Result<()>;

    fn set_xu(&self, xu: &ExtensionUnit, control: u8, data: &[u8]) -> Result<()>;

    fn get_xu(&self, xu: &ExtensionUnit, control: u8, len: usize) -> Result<Vec<u8>>;

    fn get_pu(&self, option: PuOption) -> Result<i32>;

    fn set_pu(&self, option: PuOption, value: i32) -> Result<()>;
}

/// A physical HID sensor exposed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidSensorInfo {
    pub name: String,
}

/// Activation request for one physical HID sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidProfile {
    pub sensor_name: String,
    pub frequency: u32,
}

/// One report read from a physical HID sensor.
#[derive(Debug, Clone)]
pub struct HidSample {
    pub sensor_name: String,
    /// Logical stream tag when one physical sensor carries several streams.
    pub channel: Option<StreamKind>,
    /// Vendor custom report rather than a standard sensor sample.
    pub custom: bool,
    pub frame: RawFrame,
}

/// Field of a custom HID report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportField {
    Minimum,
    Maximum,
    Name,
    Size,
    UnitExponent,
    Value,
}

pub trait HidDevice: Send + Sync {
    fn sensors(&self) -> Result<Vec<HidSensorInfo>>;

    fn open_sensor(&self, profile: &HidProfile) -> Result<()>;

    fn close_sensor(&self, sensor_name: &str) -> Result<()>;

    fn start_capture(&self, callback: HidCallback) -> Result<()>;

    /// Returns once no callback is running and none will start.
    fn stop_capture(&self);

    fn custom_report_data(
        &self,
        sensor_name: &str,
        report_name: &str,
        field: ReportField,
    ) -> Result<Vec<u8>>;
}
