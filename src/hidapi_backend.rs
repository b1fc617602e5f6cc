//! HID sensor-page transport over `hidapi`.
//!
//! Each physical sensor is one HID interface on usage page 0x20. Open
//! sensors own a device handle; while capturing, the handle is lent to a
//! reader thread that polls `read_timeout` and returns the handle when
//! joined.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use hidapi::{HidApi, HidDevice as HidHandle};

use crate::backend::{HidCallback, HidDevice, HidProfile, HidSample, HidSensorInfo, ReportField};
use crate::config::SensorOptions;
use crate::types::RawFrame;
use crate::{Result, SensorError};

pub const USAGE_PAGE_SENSOR: u16 = 0x20;
pub const USAGE_ACCEL_3D: u16 = 0x73;
pub const USAGE_GYRO_3D: u16 = 0x76;
pub const USAGE_CUSTOM: u16 = 0xE1;

const REPORT_BUFFER: usize = 64;

/// Name of the physical sensor behind a sensor-page usage.
pub fn sensor_name_for_usage(usage: u16) -> Option<&'static str> {
    match usage {
        USAGE_ACCEL_3D => Some("accel_3d"),
        USAGE_GYRO_3D => Some("gyro_3d"),
        USAGE_CUSTOM => Some("custom"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    name: String,
    path: CString,
}

struct OpenEndpoint {
    /// `None` while lent to a reader thread.
    handle: Option<HidHandle>,
}

struct Capture {
    stop_flag: Arc<AtomicBool>,
    readers: Vec<(String, JoinHandle<HidHandle>)>,
}

/// HID backend for one device, identified by vendor/product id.
pub struct HidapiDevice {
    api: Mutex<HidApi>,
    endpoints: Vec<Endpoint>,
    options: SensorOptions,
    /// Host clock origin of `backend_time_ms` for every reader.
    epoch: Instant,
    open: Mutex<BTreeMap<String, OpenEndpoint>>,
    capture: Mutex<Option<Capture>>,
}

impl HidapiDevice {
    /// Discover the sensor-page interfaces of `vid:pid`.
    pub fn enumerate(vid: u16, pid: u16, options: SensorOptions) -> Result<Self> {
        let api = HidApi::new()?;
        #[cfg(target_os = "macos")]
        {
            // Keep HID opens shared on macOS to avoid seizing the interface.
            api.set_open_exclusive(false);
        }
        let mut endpoints: Vec<Endpoint> = Vec::new();

        for info in api.device_list() {
            if info.vendor_id() != vid
                || info.product_id() != pid
                || info.usage_page() != USAGE_PAGE_SENSOR
            {
                continue;
            }
            let Some(name) = sensor_name_for_usage(info.usage()) else {
                log::debug!("Skipping sensor usage 0x{:02x} at {:?}", info.usage(), info.path());
                continue;
            };
            if endpoints.iter().any(|e| e.name == name) {
                continue;
            }
            endpoints.push(Endpoint {
                name: name.to_string(),
                path: info.path().to_owned(),
            });
        }

        log::info!(
            "Found {} HID sensor(s) on {:04x}:{:04x}",
            endpoints.len(),
            vid,
            pid
        );

        Ok(Self {
            api: Mutex::new(api),
            endpoints,
            options,
            epoch: Instant::now(),
            open: Mutex::new(BTreeMap::new()),
            capture: Mutex::new(None),
        })
    }

    fn endpoint(&self, name: &str) -> Result<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| SensorError::InvalidArgument(format!("unknown HID sensor {}", name)))
    }

    fn is_capturing(&self) -> bool {
        self.capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl HidDevice for HidapiDevice {
    fn sensors(&self) -> Result<Vec<HidSensorInfo>> {
        Ok(self
            .endpoints
            .iter()
            .map(|e| HidSensorInfo { name: e.name.clone() })
            .collect())
    }

    fn open_sensor(&self, profile: &HidProfile) -> Result<()> {
        let endpoint = self.endpoint(&profile.sensor_name)?;
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if open.contains_key(&endpoint.name) {
            return Err(SensorError::invalid_state(format!(
                "HID sensor {} is already open",
                endpoint.name
            )));
        }

        let handle = self
            .api
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open_path(&endpoint.path)?;
        // Reports are read with an explicit timeout.
        handle.set_blocking_mode(false)?;

        log::debug!(
            "Opened HID sensor {} at {} Hz",
            endpoint.name,
            profile.frequency
        );
        open.insert(
            endpoint.name.clone(),
            OpenEndpoint {
                handle: Some(handle),
            },
        );
        Ok(())
    }

    fn close_sensor(&self, sensor_name: &str) -> Result<()> {
        if self.is_capturing() {
            return Err(SensorError::invalid_state(format!(
                "cannot close HID sensor {} while capturing",
                sensor_name
            )));
        }
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sensor_name)
            .map(|_| log::debug!("Closed HID sensor {}", sensor_name))
            .ok_or_else(|| {
                SensorError::invalid_state(format!("HID sensor {} is not open", sensor_name))
            })
    }

    fn start_capture(&self, callback: HidCallback) -> Result<()> {
        let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        if capture.is_some() {
            return Err(SensorError::invalid_state("HID capture already running"));
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let lent: Vec<(String, HidHandle)> = open
            .iter_mut()
            .filter_map(|(name, endpoint)| endpoint.handle.take().map(|h| (name.clone(), h)))
            .collect();

        for (name, handle) in lent {
            let reader = ReportReader {
                custom: name == "custom",
                sensor_name: name.clone(),
                timeout_ms: self.options.hid_read_timeout_ms,
                epoch: self.epoch,
                callback: callback.clone(),
                stop_flag: stop_flag.clone(),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("hid-{}", name))
                .spawn(move || reader.run(handle));
            match spawned {
                Ok(thread) => readers.push((name, thread)),
                Err(e) => {
                    // The handle went down with the failed closure.
                    stop_flag.store(true, Ordering::Relaxed);
                    for (name, thread) in readers {
                        if let Ok(handle) = thread.join() {
                            if let Some(endpoint) = open.get_mut(&name) {
                                endpoint.handle = Some(handle);
                            }
                        }
                    }
                    return Err(SensorError::Thread(format!(
                        "failed to spawn HID reader: {}",
                        e
                    )));
                }
            }
        }

        log::info!("HID capture started on {} sensor(s)", readers.len());
        *capture = Some(Capture { stop_flag, readers });
        Ok(())
    }

    fn stop_capture(&self) {
        let Some(capture) = self
            .capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        capture.stop_flag.store(true, Ordering::Relaxed);
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, thread) in capture.readers {
            match thread.join() {
                Ok(handle) => {
                    if let Some(endpoint) = open.get_mut(&name) {
                        endpoint.handle = Some(handle);
                    }
                }
                Err(_) => log::warn!("HID reader for {} panicked", name),
            }
        }
        log::info!("HID capture stopped");
    }

    fn custom_report_data(
        &self,
        sensor_name: &str,
        report_name: &str,
        field: ReportField,
    ) -> Result<Vec<u8>> {
        self.endpoint(sensor_name)?;
        Err(SensorError::NotImplemented(format!(
            "custom report {}/{:?} on {} is not reachable through hidapi",
            report_name, field, sensor_name
        )))
    }
}

impl Drop for HidapiDevice {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

struct ReportReader {
    sensor_name: String,
    custom: bool,
    timeout_ms: i32,
    epoch: Instant,
    callback: HidCallback,
    stop_flag: Arc<AtomicBool>,
}

impl ReportReader {
    /// Poll reports until stopped, then hand the handle back.
    fn run(self, device: HidHandle) -> HidHandle {
        let mut buf = [0u8; REPORT_BUFFER];

        log::debug!("HID reader for {} started", self.sensor_name);

        while !self.stop_flag.load(Ordering::Relaxed) {
            // Timeout bounds how long a stop request goes unnoticed.
            let len = match device.read_timeout(&mut buf, self.timeout_ms) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    log::warn!("HID read error on {}: {}", self.sensor_name, e);
                    continue;
                }
            };

            (self.callback)(HidSample {
                sensor_name: self.sensor_name.clone(),
                channel: None,
                custom: self.custom,
                frame: RawFrame {
                    pixels: buf[..len].to_vec(),
                    metadata: Vec::new(),
                    backend_time_ms: self.epoch.elapsed().as_secs_f64() * 1000.0,
                },
            });
        }

        log::debug!("HID reader for {} stopped", self.sensor_name);
        device
    }
}
