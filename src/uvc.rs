use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::backend::{ExtensionUnit, PuOption, RawFrameCallback, UvcDevice};
use crate::config::SensorOptions;
use crate::extrinsics::DeviceGraph;
use crate::power::{PowerController, PowerGuard};
use crate::sensor::{Sensor, SensorBase};
use crate::source::FrameCallback;
use crate::time::TimeService;
use crate::timestamp::TimestampReader;
use crate::types::{
    BackendProfile, NativePixelFormat, NativeProfile, RawFrame, RequestMapping, StreamProfile,
};
use crate::{Result, SensorError};

/// Rectangle in pixel coordinates, inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOfInterest {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

/// Device-specific region-of-interest control.
pub trait RoiMethod: Send + Sync {
    fn set_roi(&self, roi: RegionOfInterest) -> Result<()>;
    fn get_roi(&self) -> Result<RegionOfInterest>;
}

/// Native profiles of a UVC device: backend profiles crossed with the
/// registered pixel formats.
fn native_profiles(
    backend: &[BackendProfile],
    formats: &[NativePixelFormat],
) -> Vec<NativeProfile> {
    let mut out = Vec::new();
    for bp in backend {
        for pf in formats.iter().filter(|pf| pf.fourcc == bp.fourcc) {
            for &(stream, format) in &pf.outputs {
                let native = NativeProfile {
                    stream,
                    format,
                    width: bp.width,
                    height: bp.height,
                    fps: bp.fps,
                    fourcc: bp.fourcc,
                };
                if !out.contains(&native) {
                    out.push(native);
                }
            }
        }
    }
    out
}

/// Sensor backed by a UVC video endpoint.
pub struct UvcSensor {
    base: SensorBase,
    device: Arc<dyn UvcDevice>,
    power: Arc<PowerController>,
    /// Power held for the duration of an open session.
    session_power: Mutex<Option<PowerGuard>>,
    reader: Arc<Mutex<Box<dyn TimestampReader>>>,
    pu_options: RwLock<Vec<PuOption>>,
    roi: RwLock<Option<Arc<dyn RoiMethod>>>,
}

impl UvcSensor {
    pub fn new(
        name: &str,
        device: Arc<dyn UvcDevice>,
        reader: Box<dyn TimestampReader>,
        graph: Arc<DeviceGraph>,
        options: SensorOptions,
        time: Arc<dyn TimeService>,
    ) -> Result<Self> {
        let enumerate_device = device.clone();
        let base = SensorBase::new(name, graph, options, time, move |formats| {
            let backend = enumerate_device.stream_profiles()?;
            log::debug!("UVC device reports {} backend profiles", backend.len());
            Ok(native_profiles(&backend, formats))
        })?;

        Ok(Self {
            base,
            power: PowerController::new(device.clone()),
            device,
            session_power: Mutex::new(None),
            reader: Arc::new(Mutex::new(reader)),
            pu_options: RwLock::new(Vec::new()),
            roi: RwLock::new(None),
        })
    }

    pub fn register_pixel_format(&self, pf: NativePixelFormat) {
        self.base.register_pixel_format(pf);
    }

    pub fn register_xu(&self, xu: ExtensionUnit) {
        self.power.register_xu(xu);
    }

    pub fn register_pu(&self, option: PuOption) {
        let mut options = self.pu_options.write().unwrap_or_else(PoisonError::into_inner);
        if !options.contains(&option) {
            options.push(option);
        }
    }

    pub fn power_users(&self) -> usize {
        self.power.users()
    }

    pub fn is_powered(&self) -> bool {
        self.power.is_powered()
    }

    /// Run `action` with the device powered for the duration of the call.
    pub fn invoke_powered<T>(&self, action: impl FnOnce(&dyn UvcDevice) -> Result<T>) -> Result<T> {
        let _power = PowerGuard::acquire(&self.power)?;
        action(self.device.as_ref())
    }

    fn check_pu(&self, option: PuOption) -> Result<()> {
        if self
            .pu_options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&option)
        {
            Ok(())
        } else {
            Err(SensorError::NotImplemented(format!(
                "{:?} is not supported by {}",
                option,
                self.base.name()
            )))
        }
    }

    pub fn get_pu(&self, option: PuOption) -> Result<i32> {
        self.check_pu(option)?;
        self.invoke_powered(|dev| dev.get_pu(option))
    }

    pub fn set_pu(&self, option: PuOption, value: i32) -> Result<()> {
        self.check_pu(option)?;
        self.invoke_powered(|dev| dev.set_pu(option, value))
    }

    fn check_xu(&self, xu: &ExtensionUnit) -> Result<()> {
        if self.power.has_xu(xu) {
            Ok(())
        } else {
            Err(SensorError::InvalidArgument(format!(
                "extension unit {} is not registered on {}",
                xu.unit,
                self.base.name()
            )))
        }
    }

    pub fn get_xu(&self, xu: &ExtensionUnit, control: u8, len: usize) -> Result<Vec<u8>> {
        self.check_xu(xu)?;
        self.invoke_powered(|dev| dev.get_xu(xu, control, len))
    }

    pub fn set_xu(&self, xu: &ExtensionUnit, control: u8, data: &[u8]) -> Result<()> {
        self.check_xu(xu)?;
        self.invoke_powered(|dev| dev.set_xu(xu, control, data))
    }

    pub fn set_roi_method(&self, method: Arc<dyn RoiMethod>) {
        *self.roi.write().unwrap_or_else(PoisonError::into_inner) = Some(method);
    }

    pub fn roi_method(&self) -> Result<Arc<dyn RoiMethod>> {
        self.roi
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                SensorError::NotImplemented(format!(
                    "region of interest is not implemented for {}",
                    self.base.name()
                ))
            })
    }

    /// One callback per backend profile, fanning out to every mapping it serves.
    fn frame_callback(&self, mappings: Vec<RequestMapping>) -> RawFrameCallback {
        let context = self.base.context();
        let reader = self.reader.clone();
        Arc::new(move |_profile: BackendProfile, raw: RawFrame| {
            context.on_raw_frame(&mappings, &raw, &reader);
        })
    }

    fn close_committed(&self, committed: &[BackendProfile]) {
        for profile in committed.iter().rev() {
            if let Err(e) = self.device.close(*profile) {
                self.base.report_teardown_failure("closing UVC profile", &e);
            }
        }
    }
}

impl Sensor for UvcSensor {
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

        let mut groups: Vec<(BackendProfile, Vec<RequestMapping>)> = Vec::new();
        for mapping in &mappings {
            let profile = mapping.native.backend_profile();
            match groups.iter_mut().find(|(p, _)| *p == profile) {
                Some((_, group)) => group.push(mapping.clone()),
                None => groups.push((profile, vec![mapping.clone()])),
            }
        }

        // Released on every early return below.
        let power = PowerGuard::acquire(&self.power)?;

        let mut committed = Vec::with_capacity(groups.len());
        for (profile, group) in groups {
            if let Err(e) = self.device.probe_and_commit(profile, self.frame_callback(group)) {
                log::warn!("{}: probe/commit of {:?} failed: {}", self.base.name(), profile, e);
                self.close_committed(&committed);
                return Err(e);
            }
            committed.push(profile);
        }

        if let Err(e) = self.device.stream_on() {
            log::warn!("{}: stream on failed: {}", self.base.name(), e);
            self.close_committed(&committed);
            return Err(e);
        }

        config.mappings = mappings.clone();
        config.internal = committed;
        *self
            .session_power
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(power);
        self.base.set_opened(true);

        log::info!(
            "{}: opened {} stream(s)",
            self.base.name(),
            config.mappings.len()
        );
        Ok(mappings)
    }

    fn close(&self) -> Result<()> {
        let mut config = self.base.lock_config();
        self.base.check_can_close()?;

        let internal = std::mem::take(&mut config.internal);
        self.close_committed(&internal);
        config.clear();

        // Dropping the guard releases the session's power reference.
        drop(
            self.session_power
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.base.set_opened(false);
        log::info!("{}: closed", self.base.name());
        Ok(())
    }

    fn start(&self, callback: FrameCallback) -> Result<()> {
        let _config = self.base.lock_config();
        self.base.check_can_start()?;

        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.base.begin_streaming(callback)?;
        self.device.start_callbacks();
        log::info!("{}: streaming started", self.base.name());
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        {
            let _config = self.base.lock_config();
            self.base.check_can_stop()?;
            self.base.end_streaming(|| self.device.stop_callbacks());
        }
        // Drained outside the configuration lock.
        self.base.drain_dispatch();
        log::info!("{}: streaming stopped", self.base.name());
        Ok(())
    }
}

impl Drop for UvcSensor {
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
