//! HID motion sensor: several logical streams over shared physical
//! endpoints.
//!
//! The device-specific collaborator supplies three tables at construction:
//! which physical sensor name backs which logical profile, the
//! fps -> sampling frequency table per stream kind, and (optionally) a
//! table per custom sensor name. The stream-kind table always takes
//! precedence over the custom one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::{HidCallback, HidDevice, HidProfile, HidSample, ReportField};
use crate::config::SensorOptions;
use crate::extrinsics::DeviceGraph;
use crate::sensor::{Sensor, SensorBase};
use crate::source::FrameCallback;
use crate::time::TimeService;
use crate::timestamp::TimestampReader;
use crate::types::{
    Format, Fourcc, NativePixelFormat, NativeProfile, RequestMapping, StreamKind, StreamProfile,
};
use crate::{Result, SensorError};

pub const FOURCC_GYRO: Fourcc = Fourcc::new(b"GYRO");
pub const FOURCC_ACCEL: Fourcc = Fourcc::new(b"ACCL");
pub const FOURCC_GPIO: Fourcc = Fourcc::new(b"GPIO");

/// Four-character tag of a logical HID stream.
pub fn stream_to_fourcc(stream: StreamKind) -> Result<Fourcc> {
    match stream {
        StreamKind::Gyro => Ok(FOURCC_GYRO),
        StreamKind::Accel => Ok(FOURCC_ACCEL),
        StreamKind::Gpio(1..=4) => Ok(FOURCC_GPIO),
        other => Err(SensorError::InvalidArgument(format!(
            "{} is not a HID stream",
            other
        ))),
    }
}

/// Lookup tables describing how logical streams sit on physical sensors.
#[derive(Debug, Clone, Default)]
pub struct HidStreamTables {
    /// Physical sensor name and one logical profile it can deliver.
    pub sensor_profiles: Vec<(String, StreamProfile)>,
    /// `{stream -> {fps -> sampling frequency}}`.
    pub sampling_frequencies: HashMap<StreamKind, HashMap<u32, u32>>,
    /// `{custom sensor name -> {fps -> sampling frequency}}`.
    pub custom_sampling_frequencies: HashMap<String, HashMap<u32, u32>>,
}

impl HidStreamTables {
    pub fn sensor_profiles(&self, sensor_name: &str) -> Vec<StreamProfile> {
        self.sensor_profiles
            .iter()
            .filter(|(name, _)| name == sensor_name)
            .map(|(_, p)| *p)
            .collect()
    }

    pub fn stream_to_sensor_name(&self, stream: StreamKind) -> Result<&str> {
        self.sensor_profiles
            .iter()
            .find(|(_, p)| p.stream == stream)
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| {
                SensorError::InvalidArgument(format!("no HID sensor carries {}", stream))
            })
    }

    /// Stream-kind table first, then the custom table of the backing sensor.
    pub fn fps_to_sampling_frequency(&self, stream: StreamKind, fps: u32) -> Result<u32> {
        if let Some(freq) = self
            .sampling_frequencies
            .get(&stream)
            .and_then(|table| table.get(&fps))
        {
            return Ok(*freq);
        }
        if let Ok(name) = self.stream_to_sensor_name(stream) {
            if let Some(freq) = self
                .custom_sampling_frequencies
                .get(name)
                .and_then(|table| table.get(&fps))
            {
                return Ok(*freq);
            }
        }
        Err(SensorError::UnknownFrequency { stream, fps })
    }
}

/// Logical streams currently configured on one physical sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PhysicalSensor {
    frequency: u32,
    streams: BTreeSet<StreamKind>,
}

fn hid_pixel_formats() -> Vec<NativePixelFormat> {
    let mut gpio_outputs = Vec::new();
    for line in 1..=4 {
        gpio_outputs.push((StreamKind::Gpio(line), Format::GpioRaw));
    }
    vec![
        NativePixelFormat::new(FOURCC_GYRO, 1, vec![(StreamKind::Gyro, Format::MotionXyz32f)]),
        NativePixelFormat::new(FOURCC_ACCEL, 1, vec![(StreamKind::Accel, Format::MotionXyz32f)]),
        NativePixelFormat::new(FOURCC_GPIO, 1, gpio_outputs),
    ]
}

/// Sensor demultiplexing HID reports into logical motion/GPIO streams.
pub struct HidSensor {
    base: SensorBase,
    device: Arc<dyn HidDevice>,
    tables: Arc<HidStreamTables>,
    iio_reader: Arc<Mutex<Box<dyn TimestampReader>>>,
    custom_reader: Arc<Mutex<Box<dyn TimestampReader>>>,
    /// Guarded by the configuration lock; locked only while holding it.
    physical: Mutex<BTreeMap<String, PhysicalSensor>>,
}

impl HidSensor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        device: Arc<dyn HidDevice>,
        iio_reader: Box<dyn TimestampReader>,
        custom_reader: Box<dyn TimestampReader>,
        tables: HidStreamTables,
        graph: Arc<DeviceGraph>,
        options: SensorOptions,
        time: Arc<dyn TimeService>,
    ) -> Result<Self> {
        let tables = Arc::new(tables);
        let enumerate_device = device.clone();
        let enumerate_tables = tables.clone();
        let base = SensorBase::new(name, graph, options, time, move |_formats| {
            let mut natives = Vec::new();
            for info in enumerate_device.sensors()? {
                for profile in enumerate_tables.sensor_profiles(&info.name) {
                    let native = NativeProfile {
                        stream: profile.stream,
                        format: profile.format,
                        width: profile.width,
                        height: profile.height,
                        fps: profile.fps,
                        fourcc: stream_to_fourcc(profile.stream)?,
                    };
                    if !natives.contains(&native) {
                        natives.push(native);
                    }
                }
            }
            log::debug!("HID device exposes {} native profiles", natives.len());
            Ok(natives)
        })?;

        for pf in hid_pixel_formats() {
            base.register_pixel_format(pf);
        }

        Ok(Self {
            base,
            device,
            tables,
            iio_reader: Arc::new(Mutex::new(iio_reader)),
            custom_reader: Arc::new(Mutex::new(custom_reader)),
            physical: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn tables(&self) -> &HidStreamTables {
        &self.tables
    }

    pub fn sensor_profiles(&self, sensor_name: &str) -> Vec<StreamProfile> {
        self.tables.sensor_profiles(sensor_name)
    }

    pub fn stream_to_sensor_name(&self, stream: StreamKind) -> Result<&str> {
        self.tables.stream_to_sensor_name(stream)
    }

    pub fn fps_to_sampling_frequency(&self, stream: StreamKind, fps: u32) -> Result<u32> {
        self.tables.fps_to_sampling_frequency(stream, fps)
    }

    /// Physical sensors currently active, with their logical streams.
    pub fn active_endpoints(&self) -> BTreeMap<String, Vec<StreamKind>> {
        self.physical
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, p)| (name.clone(), p.streams.iter().copied().collect()))
            .collect()
    }

    /// Raw vendor report field, independent of streaming.
    pub fn custom_report_data(
        &self,
        sensor_name: &str,
        report_name: &str,
        field: ReportField,
    ) -> Result<Vec<u8>> {
        self.device
            .custom_report_data(sensor_name, report_name, field)
    }

    fn plan(&self, mappings: &[RequestMapping]) -> Result<BTreeMap<String, PhysicalSensor>> {
        let mut plan: BTreeMap<String, PhysicalSensor> = BTreeMap::new();
        for mapping in mappings {
            let stream = mapping.request.stream;
            let name = self.tables.stream_to_sensor_name(stream)?;
            let frequency = self
                .tables
                .fps_to_sampling_frequency(stream, mapping.request.fps)?;
            let entry = plan.entry(name.to_string()).or_insert(PhysicalSensor {
                frequency,
                streams: BTreeSet::new(),
            });
            if frequency > entry.frequency {
                log::debug!(
                    "{}: raising {} to {} Hz for {}",
                    self.base.name(),
                    name,
                    frequency,
                    stream
                );
                entry.frequency = frequency;
            }
            entry.streams.insert(stream);
        }
        Ok(plan)
    }

    fn close_endpoint(&self, sensor_name: &str) {
        match self.device.close_sensor(sensor_name) {
            Ok(()) => log::debug!("{}: deactivated {}", self.base.name(), sensor_name),
            Err(e) => self
                .base
                .report_teardown_failure(&format!("closing HID sensor {}", sensor_name), &e),
        }
    }

    /// Close one logical stream; its physical endpoint is deactivated once
    /// no other logical stream uses it, and otherwise re-activated at the
    /// rate its remaining streams need. If that re-activation fails the
    /// endpoint's remaining streams are closed too.
    pub fn close_stream(&self, stream: StreamKind) -> Result<()> {
        let mut config = self.base.lock_config();
        self.base.check_can_close()?;

        let idx = config
            .mappings
            .iter()
            .position(|m| m.request.stream == stream)
            .ok_or_else(|| SensorError::InvalidArgument(format!("{} is not open", stream)))?;
        let mapping = config.mappings.remove(idx);
        if let Some(pos) = config
            .internal
            .iter()
            .position(|p| *p == mapping.native.backend_profile())
        {
            config.internal.remove(pos);
        }

        let mut physical = self.physical.lock().unwrap_or_else(PoisonError::into_inner);
        let owner = physical
            .iter()
            .find(|(_, p)| p.streams.contains(&stream))
            .map(|(name, _)| name.clone());
        if let Some(name) = owner {
            let (remaining, current) = match physical.get_mut(&name) {
                Some(p) => {
                    p.streams.remove(&stream);
                    (p.streams.clone(), p.frequency)
                }
                None => (BTreeSet::new(), 0),
            };
            let needed = config
                .mappings
                .iter()
                .filter(|m| remaining.contains(&m.request.stream))
                .filter_map(|m| {
                    self.tables
                        .fps_to_sampling_frequency(m.request.stream, m.request.fps)
                        .ok()
                })
                .max();
            if remaining.is_empty() {
                physical.remove(&name);
                self.close_endpoint(&name);
            } else if let Some(frequency) = needed.filter(|f| *f != current) {
                // The endpoint was activated for the departed stream's rate.
                log::debug!(
                    "{}: re-activating {} at {} Hz after closing {}",
                    self.base.name(),
                    name,
                    frequency,
                    stream
                );
                self.close_endpoint(&name);
                let profile = HidProfile {
                    sensor_name: name.clone(),
                    frequency,
                };
                match self.device.open_sensor(&profile) {
                    Ok(()) => {
                        if let Some(p) = physical.get_mut(&name) {
                            p.frequency = frequency;
                        }
                    }
                    Err(e) => {
                        self.base
                            .report_teardown_failure(&format!("re-activating HID sensor {}", name), &e);
                        physical.remove(&name);
                        config
                            .mappings
                            .retain(|m| !remaining.contains(&m.request.stream));
                        config.internal = config
                            .mappings
                            .iter()
                            .map(|m| m.native.backend_profile())
                            .collect();
                    }
                }
            }
        }

        if config.mappings.is_empty() {
            self.base.set_opened(false);
            log::info!("{}: closed", self.base.name());
        }
        Ok(())
    }

    fn capture_callback(&self, mappings: &[RequestMapping]) -> HidCallback {
        let physical = self.physical.lock().unwrap_or_else(PoisonError::into_inner);
        let mut routes: HashMap<String, Vec<RequestMapping>> = HashMap::new();
        for (name, p) in physical.iter() {
            let targets = mappings
                .iter()
                .filter(|m| p.streams.contains(&m.request.stream))
                .cloned()
                .collect();
            routes.insert(name.clone(), targets);
        }

        let context = self.base.context();
        let iio_reader = self.iio_reader.clone();
        let custom_reader = self.custom_reader.clone();
        Arc::new(move |sample: HidSample| {
            let Some(targets) = routes.get(&sample.sensor_name) else {
                log::trace!("Report from inactive HID sensor {}", sample.sensor_name);
                return;
            };
            let reader = if sample.custom { &custom_reader } else { &iio_reader };
            let served = targets
                .iter()
                .filter(|m| sample.channel.map_or(true, |c| c == m.request.stream));
            context.on_raw_frame(served, &sample.frame, reader);
        })
    }
}

impl Sensor for HidSensor {
    fn base(&self) -> &SensorBase {
        &self.base
    }

    fn principal_requests(&self) -> Result<Vec<StreamProfile>> {
        self.base.principal_requests()
    }

    fn open(&self, requests: &[StreamProfile]) -> Result<Vec<RequestMapping>> {
        let mut config = self.base.lock_config();
        self.base.check_can_open()?;

        let mappings = self.base.resolve_requests(requests)?;
        // Frequency misses fail here, before any endpoint is touched.
        let plan = self.plan(&mappings)?;

        let mut activated: Vec<&str> = Vec::with_capacity(plan.len());
        for (name, p) in &plan {
            let profile = HidProfile {
                sensor_name: name.clone(),
                frequency: p.frequency,
            };
            if let Err(e) = self.device.open_sensor(&profile) {
                log::warn!("{}: activating {} failed: {}", self.base.name(), name, e);
                for opened in activated.iter().rev() {
                    self.close_endpoint(opened);
                }
                return Err(e);
            }
            activated.push(name);
        }

        let endpoints = activated.len();
        config.internal = mappings.iter().map(|m| m.native.backend_profile()).collect();
        config.mappings = mappings.clone();
        *self.physical.lock().unwrap_or_else(PoisonError::into_inner) = plan;
        self.base.set_opened(true);

        log::info!(
            "{}: opened {} stream(s) on {} endpoint(s)",
            self.base.name(),
            config.mappings.len(),
            endpoints
        );
        Ok(mappings)
    }

    fn close(&self) -> Result<()> {
        let mut config = self.base.lock_config();
        self.base.check_can_close()?;

        let physical = std::mem::take(
            &mut *self.physical.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for name in physical.keys() {
            self.close_endpoint(name);
        }
        config.clear();
        self.base.set_opened(false);
        log::info!("{}: closed", self.base.name());
        Ok(())
    }

    fn start(&self, callback: FrameCallback) -> Result<()> {
        let config = self.base.lock_config();
        self.base.check_can_start()?;

        for reader in [&self.iio_reader, &self.custom_reader] {
            reader.lock().unwrap_or_else(PoisonError::into_inner).reset();
        }
        let capture = self.capture_callback(&config.mappings);
        self.base.begin_streaming(callback)?;
        if let Err(e) = self.device.start_capture(capture) {
            log::warn!("{}: start capture failed: {}", self.base.name(), e);
            self.base.end_streaming(|| {});
            drop(config);
            self.base.drain_dispatch();
            return Err(e);
        }
        log::info!("{}: streaming started", self.base.name());
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        {
            let _config = self.base.lock_config();
            self.base.check_can_stop()?;
            self.base.end_streaming(|| self.device.stop_capture());
        }
        self.base.drain_dispatch();
        log::info!("{}: streaming stopped", self.base.name());
        Ok(())
    }
}

impl Drop for HidSensor {
    fn drop(&mut self) {
        if self.is_streaming() {
            if let Err(e) = self.stop() {
                log::warn!("{}: stop on drop failed: {}", self.base.name(), e);
            }
        }
        if self.is_opened() {
            if let Err(e) = self.close() {
                log::warn!("{}: close on drop failed: {}", self.base.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> HidStreamTables {
        let mut sampling = HashMap::new();
        sampling.insert(StreamKind::Gyro, HashMap::from([(200, 5), (400, 4)]));
        sampling.insert(StreamKind::Accel, HashMap::from([(63, 1), (250, 4)]));
        HidStreamTables {
            sensor_profiles: vec![
                (
                    "motion_module".into(),
                    StreamProfile::motion(StreamKind::Gyro, Format::MotionXyz32f, 200),
                ),
                (
                    "motion_module".into(),
                    StreamProfile::motion(StreamKind::Accel, Format::MotionXyz32f, 63),
                ),
                (
                    "custom".into(),
                    StreamProfile::motion(StreamKind::Gpio(1), Format::GpioRaw, 1),
                ),
            ],
            sampling_frequencies: sampling,
            custom_sampling_frequencies: HashMap::from([(
                "custom".to_string(),
                HashMap::from([(1, 1000)]),
            )]),
        }
    }

    #[test]
    fn test_fourcc_per_stream() {
        assert_eq!(stream_to_fourcc(StreamKind::Gyro).unwrap().to_string(), "GYRO");
        assert_eq!(stream_to_fourcc(StreamKind::Accel).unwrap().to_string(), "ACCL");
        assert_eq!(stream_to_fourcc(StreamKind::Gpio(3)).unwrap(), FOURCC_GPIO);
        assert!(stream_to_fourcc(StreamKind::Gpio(5)).is_err());
        assert!(stream_to_fourcc(StreamKind::Depth).is_err());
    }

    #[test]
    fn test_sensor_grouping() {
        let t = tables();
        assert_eq!(t.sensor_profiles("motion_module").len(), 2);
        assert_eq!(t.stream_to_sensor_name(StreamKind::Accel).unwrap(), "motion_module");
        assert!(t.stream_to_sensor_name(StreamKind::Gpio(2)).is_err());
    }

    #[test]
    fn test_sampling_lookup() {
        let t = tables();
        assert_eq!(t.fps_to_sampling_frequency(StreamKind::Gyro, 400).unwrap(), 4);
        assert_eq!(t.fps_to_sampling_frequency(StreamKind::Gpio(1), 1).unwrap(), 1000);
        match t.fps_to_sampling_frequency(StreamKind::Gyro, 100) {
            Err(SensorError::UnknownFrequency { stream, fps }) => {
                assert_eq!(stream, StreamKind::Gyro);
                assert_eq!(fps, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stream_table_beats_custom_table() {
        let mut t = tables();
        t.sampling_frequencies
            .insert(StreamKind::Gpio(1), HashMap::from([(1, 7)]));
        assert_eq!(t.fps_to_sampling_frequency(StreamKind::Gpio(1), 1).unwrap(), 7);
    }
}
