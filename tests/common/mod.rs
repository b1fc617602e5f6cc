#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use depth_sensor::backend::{
    ExtensionUnit, HidCallback, HidDevice, HidProfile, HidSample, HidSensorInfo, PowerState,
    PuOption, RawFrameCallback, ReportField, UvcDevice,
};
use depth_sensor::{
    BackendProfile, Frame, FrameCallback, Fourcc, RawFrame, Result, SensorError, StreamKind,
    TimeService,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Clock advanced by hand.
#[derive(Default)]
pub struct ManualTime {
    now_ms: Mutex<f64>,
}

impl ManualTime {
    pub fn set(&self, ms: f64) {
        *self.now_ms.lock().unwrap() = ms;
    }
}

impl TimeService for ManualTime {
    fn now_ms(&self) -> f64 {
        *self.now_ms.lock().unwrap()
    }
}

/// Frame callback appending every delivered frame to a shared list.
pub fn collector() -> (FrameCallback, Arc<Mutex<Vec<Frame>>>) {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let callback: FrameCallback = Arc::new(move |frame: Frame| sink.lock().unwrap().push(frame));
    (callback, frames)
}

pub fn raw(pixels: &[u8]) -> RawFrame {
    RawFrame {
        pixels: pixels.to_vec(),
        metadata: Vec::new(),
        backend_time_ms: 0.0,
    }
}

/// Raw HID sample with an in-band microsecond counter.
pub fn iio_raw(usec: u64) -> RawFrame {
    RawFrame {
        pixels: vec![1, 2, 3, 4],
        metadata: usec.to_le_bytes().to_vec(),
        backend_time_ms: 0.0,
    }
}

pub const Z16: Fourcc = Fourcc::new(b"Z16 ");

#[derive(Default)]
pub struct UvcState {
    pub power: Option<PowerState>,
    pub power_transitions: Vec<PowerState>,
    pub committed: Vec<(BackendProfile, RawFrameCallback)>,
    pub closed: Vec<BackendProfile>,
    pub streaming_on: bool,
    pub callbacks_enabled: bool,
    pub xu_inits: usize,
    pub fail_commit_at: Option<usize>,
    pub fail_stream_on: bool,
    pub fail_power_on: bool,
    pub fail_xu_init: bool,
    pub pu_values: BTreeMap<String, i32>,
}

/// In-memory UVC endpoint.
pub struct MockUvcDevice {
    pub profiles: Vec<BackendProfile>,
    pub state: Mutex<UvcState>,
    pub enumerations: Mutex<usize>,
}

impl MockUvcDevice {
    pub fn new(profiles: Vec<BackendProfile>) -> Arc<Self> {
        Arc::new(Self {
            profiles,
            state: Mutex::new(UvcState::default()),
            enumerations: Mutex::new(0),
        })
    }

    /// Depth camera offering 640x480@30 and 1280x720@15.
    pub fn depth_camera() -> Arc<Self> {
        Self::new(vec![
            BackendProfile { width: 640, height: 480, fps: 30, fourcc: Z16 },
            BackendProfile { width: 1280, height: 720, fps: 15, fourcc: Z16 },
        ])
    }

    /// Deliver `frame` as the capture thread would; the state lock is held
    /// for the whole callback, like a backend holding its stream lock.
    pub fn emit(&self, profile: BackendProfile, frame: RawFrame) -> bool {
        let state = self.state.lock().unwrap();
        if !state.callbacks_enabled {
            return false;
        }
        match state.committed.iter().find(|(p, _)| *p == profile) {
            Some((_, callback)) => {
                callback(profile, frame);
                true
            }
            None => false,
        }
    }

    pub fn is_powered(&self) -> bool {
        self.state.lock().unwrap().power == Some(PowerState::D0)
    }
}

impl UvcDevice for MockUvcDevice {
    fn stream_profiles(&self) -> Result<Vec<BackendProfile>> {
        *self.enumerations.lock().unwrap() += 1;
        Ok(self.profiles.clone())
    }

    fn probe_and_commit(&self, profile: BackendProfile, callback: RawFrameCallback) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commit_at == Some(state.committed.len()) {
            return Err(SensorError::backend("probe_and_commit", "injected failure"));
        }
        state.committed.push((profile, callback));
        Ok(())
    }

    fn stream_on(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_stream_on {
            return Err(SensorError::backend("stream_on", "injected failure"));
        }
        state.streaming_on = true;
        Ok(())
    }

    fn start_callbacks(&self) {
        self.state.lock().unwrap().callbacks_enabled = true;
    }

    fn stop_callbacks(&self) {
        self.state.lock().unwrap().callbacks_enabled = false;
    }

    fn close(&self, profile: BackendProfile) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.committed.retain(|(p, _)| *p != profile);
        state.closed.push(profile);
        if state.committed.is_empty() {
            state.streaming_on = false;
        }
        Ok(())
    }

    fn set_power_state(&self, power: PowerState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if power == PowerState::D0 && state.fail_power_on {
            return Err(SensorError::backend("set_power_state", "injected failure"));
        }
        state.power = Some(power);
        state.power_transitions.push(power);
        Ok(())
    }

    fn init_xu(&self, _xu: &ExtensionUnit) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_xu_init {
            return Err(SensorError::backend("init_xu", "injected failure"));
        }
        state.xu_inits += 1;
        Ok(())
    }

    fn set_xu(&self, _xu: &ExtensionUnit, control: u8, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.power != Some(PowerState::D0) {
            return Err(SensorError::backend("set_xu", "device suspended"));
        }
        state.pu_values.insert(format!("xu{}", control), data.len() as i32);
        Ok(())
    }

    fn get_xu(&self, _xu: &ExtensionUnit, control: u8, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if state.power != Some(PowerState::D0) {
            return Err(SensorError::backend("get_xu", "device suspended"));
        }
        Ok(vec![control; len])
    }

    fn get_pu(&self, option: PuOption) -> Result<i32> {
        let state = self.state.lock().unwrap();
        if state.power != Some(PowerState::D0) {
            return Err(SensorError::backend("get_pu", "device suspended"));
        }
        Ok(state.pu_values.get(&format!("{:?}", option)).copied().unwrap_or(0))
    }

    fn set_pu(&self, option: PuOption, value: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.power != Some(PowerState::D0) {
            return Err(SensorError::backend("set_pu", "device suspended"));
        }
        state.pu_values.insert(format!("{:?}", option), value);
        Ok(())
    }
}

#[derive(Default)]
pub struct HidState {
    pub open: BTreeMap<String, u32>,
    pub open_calls: Vec<HidProfile>,
    pub closed: Vec<String>,
    pub callback: Option<HidCallback>,
    pub fail_open: Option<String>,
}

/// In-memory HID device exposing named physical sensors.
pub struct MockHidDevice {
    pub sensors: Vec<String>,
    pub state: Mutex<HidState>,
}

impl MockHidDevice {
    pub fn new(sensors: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            sensors: sensors.iter().map(|s| s.to_string()).collect(),
            state: Mutex::new(HidState::default()),
        })
    }

    pub fn emit(&self, sensor: &str, channel: Option<StreamKind>, custom: bool, frame: RawFrame) -> bool {
        let state = self.state.lock().unwrap();
        if !state.open.contains_key(sensor) {
            return false;
        }
        match &state.callback {
            Some(callback) => {
                callback(HidSample {
                    sensor_name: sensor.to_string(),
                    channel,
                    custom,
                    frame,
                });
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, sensor: &str) -> bool {
        self.state.lock().unwrap().open.contains_key(sensor)
    }
}

impl HidDevice for MockHidDevice {
    fn sensors(&self) -> Result<Vec<HidSensorInfo>> {
        Ok(self
            .sensors
            .iter()
            .map(|name| HidSensorInfo { name: name.clone() })
            .collect())
    }

    fn open_sensor(&self, profile: &HidProfile) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open.as_deref() == Some(profile.sensor_name.as_str()) {
            return Err(SensorError::backend("open_sensor", "injected failure"));
        }
        state.open_calls.push(profile.clone());
        state.open.insert(profile.sensor_name.clone(), profile.frequency);
        Ok(())
    }

    fn close_sensor(&self, sensor_name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.open.remove(sensor_name);
        state.closed.push(sensor_name.to_string());
        Ok(())
    }

    fn start_capture(&self, callback: HidCallback) -> Result<()> {
        self.state.lock().unwrap().callback = Some(callback);
        Ok(())
    }

    fn stop_capture(&self) {
        self.state.lock().unwrap().callback = None;
    }

    fn custom_report_data(
        &self,
        sensor_name: &str,
        report_name: &str,
        field: ReportField,
    ) -> Result<Vec<u8>> {
        if !self.sensors.iter().any(|s| s == sensor_name) {
            return Err(SensorError::InvalidArgument(sensor_name.to_string()));
        }
        match field {
            ReportField::Name => Ok(report_name.as_bytes().to_vec()),
            ReportField::Value => Ok(vec![0x2a]),
            _ => Ok(Vec::new()),
        }
    }
}
