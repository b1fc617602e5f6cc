//! Lifecycle and shared state common to every sensor.
//!
//! A sensor is closed, opened or streaming:
//! `closed -> open -> opened -> start -> streaming -> stop -> opened -> close -> closed`.
//! The configuration lock serializes the four transitions; the opened and
//! streaming flags are atomics written only while that lock is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::SensorOptions;
use crate::extrinsics::{DeviceGraph, Pose, SensorId};
use crate::lazy::Lazy;
use crate::metadata::{MetadataKind, MetadataParser, MetadataParserMap};
use crate::notifications::{
    Notification, NotificationCategory, NotificationsCallback, NotificationsProcessor, Severity,
};
use crate::request_mapper;
use crate::source::{DispatchOutcome, FrameCallback, FrameSink, FrameSource};
use crate::time::TimeService;
use crate::timestamp::TimestampReader;
use crate::types::{
    BackendProfile, Frame, NativePixelFormat, NativeProfile, RawFrame, RequestMapping, StreamKind,
    StreamProfile,
};
use crate::{Result, SensorError};

/// Invoked on the capture path for every frame before it is queued.
pub type BeforeFrameCallback = Arc<dyn Fn(StreamKind, &Frame) + Send + Sync>;

/// Accepted mappings plus the backend entries serving them.
#[derive(Debug, Default)]
pub(crate) struct Configuration {
    pub mappings: Vec<RequestMapping>,
    pub internal: Vec<BackendProfile>,
}

impl Configuration {
    pub fn clear(&mut self) {
        self.mappings.clear();
        self.internal.clear();
    }
}

struct ActiveStream {
    sink: FrameSink,
    parsers: Arc<MetadataParserMap>,
}

/// State reachable from backend capture callbacks.
pub(crate) struct StreamContext {
    name: String,
    streaming: AtomicBool,
    active: RwLock<Option<Arc<ActiveStream>>>,
    before_frame: RwLock<Option<BeforeFrameCallback>>,
    notifications: Arc<NotificationsProcessor>,
    time: Arc<dyn TimeService>,
}

impl StreamContext {
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn raise(&self, category: NotificationCategory, severity: Severity, description: String) {
        self.notifications.raise_notification(Notification {
            category,
            severity,
            description,
            timestamp_ms: self.time.now_ms(),
        });
    }

    /// Turn a raw buffer into one typed frame per mapping it serves and
    /// queue them for dispatch.
    ///
    /// The buffer is stamped once; every mapping shares its timestamp and
    /// frame number.
    pub fn on_raw_frame<'a>(
        &self,
        mappings: impl IntoIterator<Item = &'a RequestMapping>,
        raw: &RawFrame,
        reader: &Mutex<Box<dyn TimestampReader>>,
    ) {
        if !self.is_streaming() {
            return;
        }
        let mut mappings = mappings.into_iter().peekable();
        let Some(first) = mappings.peek().copied() else {
            return;
        };
        let active = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(active) = active else {
            return;
        };

        if raw.pixels.is_empty() {
            self.raise(
                NotificationCategory::FrameCorrupted,
                Severity::Warn,
                format!("{}: empty {} frame", self.name, first.request.stream),
            );
            return;
        }

        let system_time_ms = self.time.now_ms();
        let metadata = reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read(first, raw, system_time_ms);
        let attributes = active.parsers.parse_all(raw);
        let before = self
            .before_frame
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for mapping in mappings {
            let frame = Frame {
                profile: mapping.request,
                fourcc: mapping.native.fourcc,
                data: raw.pixels.clone(),
                metadata,
                attributes: attributes.clone(),
            };
            if let Some(before) = &before {
                before(mapping.request.stream, &frame);
            }
            if active.sink.dispatch(frame) == DispatchOutcome::Dropped {
                self.raise(
                    NotificationCategory::FramesDropped,
                    Severity::Warn,
                    format!("{}: {} frame dropped, queue full", self.name, mapping.request.stream),
                );
            }
        }
    }
}

/// State and behaviour shared by UVC and HID sensors.
pub struct SensorBase {
    name: String,
    id: SensorId,
    graph: Arc<DeviceGraph>,
    profiles: Lazy<Vec<NativeProfile>>,
    pixel_formats: Arc<RwLock<Vec<NativePixelFormat>>>,
    parsers: Mutex<MetadataParserMap>,
    config: Mutex<Configuration>,
    opened: AtomicBool,
    source: FrameSource,
    context: Arc<StreamContext>,
}

impl SensorBase {
    /// `enumerate` builds the native profile list from the registered pixel
    /// formats; it runs once, on first query.
    pub fn new(
        name: &str,
        graph: Arc<DeviceGraph>,
        options: SensorOptions,
        time: Arc<dyn TimeService>,
        enumerate: impl Fn(&[NativePixelFormat]) -> Result<Vec<NativeProfile>> + Send + Sync + 'static,
    ) -> Result<Self> {
        let pixel_formats: Arc<RwLock<Vec<NativePixelFormat>>> = Arc::default();
        let formats = pixel_formats.clone();
        let profiles = Lazy::new(move || {
            let formats = formats.read().unwrap_or_else(PoisonError::into_inner);
            enumerate(&formats)
        });

        let notifications = Arc::new(NotificationsProcessor::new(
            options.notification_queue_capacity,
        )?);
        let id = SensorId::next();
        graph.set_pose(id, Lazy::ready(Pose::identity()));

        Ok(Self {
            name: name.to_string(),
            id,
            graph,
            source: FrameSource::new(name, options.frame_queue_capacity, options.drop_on_full),
            profiles,
            pixel_formats,
            parsers: Mutex::new(MetadataParserMap::new()),
            config: Mutex::new(Configuration::default()),
            opened: AtomicBool::new(false),
            context: Arc::new(StreamContext {
                name: name.to_string(),
                streaming: AtomicBool::new(false),
                active: RwLock::new(None),
                before_frame: RwLock::new(None),
                notifications,
                time,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> SensorId {
        self.id
    }

    pub fn is_streaming(&self) -> bool {
        self.context.is_streaming()
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Native profiles, enumerated on first call and cached.
    pub fn stream_profiles(&self) -> Result<Arc<Vec<NativeProfile>>> {
        self.profiles.get()
    }

    /// Registering a format invalidates the cached profile list.
    pub fn register_pixel_format(&self, pf: NativePixelFormat) {
        self.pixel_formats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pf);
        self.profiles.invalidate();
    }

    pub fn pixel_formats(&self) -> Vec<NativePixelFormat> {
        self.pixel_formats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Parsers are frozen while streaming.
    pub fn register_metadata(
        &self,
        kind: MetadataKind,
        parser: Arc<dyn MetadataParser>,
    ) -> Result<()> {
        let _config = self.lock_config();
        if self.is_streaming() {
            return Err(SensorError::invalid_state(format!(
                "{}: metadata parsers cannot change while streaming",
                self.name
            )));
        }
        let mut parsers = self.parsers.lock().unwrap_or_else(PoisonError::into_inner);
        if !parsers.insert(kind, parser) {
            log::debug!("{}: replaced metadata parser for {:?}", self.name, kind);
        }
        Ok(())
    }

    pub fn register_notifications_callback(&self, callback: NotificationsCallback) {
        self.context.notifications.set_callback(callback);
    }

    pub fn register_on_before_frame_callback(&self, callback: BeforeFrameCallback) {
        *self
            .context
            .before_frame
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn set_pose(&self, pose: Lazy<Pose>) {
        self.graph.set_pose(self.id, pose);
    }

    pub fn pose(&self) -> Result<Pose> {
        self.graph.pose(self.id)
    }

    /// Rigid transform from this sensor's frame into `other`'s.
    pub fn extrinsics_to(&self, other: &SensorBase) -> Result<Pose> {
        if !Arc::ptr_eq(&self.graph, &other.graph) {
            return Err(SensorError::InvalidArgument(format!(
                "{} and {} belong to different devices",
                self.name, other.name
            )));
        }
        self.graph.extrinsics(self.id, other.id)
    }

    /// Read-only snapshot of the accepted configuration.
    pub fn active_configuration(&self) -> Vec<RequestMapping> {
        self.lock_config().mappings.clone()
    }

    pub fn principal_requests(&self) -> Result<Vec<StreamProfile>> {
        let natives = self.stream_profiles()?;
        Ok(request_mapper::principal_requests(&natives, &self.pixel_formats()))
    }

    pub(crate) fn resolve_requests(&self, requests: &[StreamProfile]) -> Result<Vec<RequestMapping>> {
        let natives = self.stream_profiles()?;
        let formats = self.pixel_formats.read().unwrap_or_else(PoisonError::into_inner);
        request_mapper::resolve_requests(requests, &natives, &formats)
    }

    pub(crate) fn lock_config(&self) -> MutexGuard<'_, Configuration> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn context(&self) -> Arc<StreamContext> {
        self.context.clone()
    }

    /// Must be called with the configuration lock held.
    pub(crate) fn set_opened(&self, opened: bool) {
        self.opened.store(opened, Ordering::Release);
    }

    /// Validate an `open` against the current state.
    pub(crate) fn check_can_open(&self) -> Result<()> {
        if self.is_opened() {
            return Err(SensorError::invalid_state(format!("{} is already opened", self.name)));
        }
        Ok(())
    }

    /// Validate a `close` against the current state.
    pub(crate) fn check_can_close(&self) -> Result<()> {
        if self.is_streaming() {
            return Err(SensorError::invalid_state(format!(
                "{} must be stopped before closing",
                self.name
            )));
        }
        if !self.is_opened() {
            return Err(SensorError::invalid_state(format!("{} is not opened", self.name)));
        }
        Ok(())
    }

    /// Validate a `start` against the current state.
    pub(crate) fn check_can_start(&self) -> Result<()> {
        if !self.is_opened() {
            return Err(SensorError::invalid_state(format!(
                "{} must be opened before starting",
                self.name
            )));
        }
        if self.is_streaming() {
            return Err(SensorError::invalid_state(format!("{} is already streaming", self.name)));
        }
        Ok(())
    }

    /// Spawn dispatch and accept frames. Configuration lock held.
    pub(crate) fn begin_streaming(&self, callback: FrameCallback) -> Result<()> {
        let sink = self.source.start(callback)?;
        let parsers = Arc::new(
            self.parsers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        );
        *self
            .context
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(ActiveStream { sink, parsers }));
        self.context.streaming.store(true, Ordering::Release);
        Ok(())
    }

    /// Validate a `stop` against the current state.
    pub(crate) fn check_can_stop(&self) -> Result<()> {
        if self.source.is_dispatch_thread() {
            return Err(SensorError::invalid_state(format!(
                "{} cannot be stopped from its own frame callback",
                self.name
            )));
        }
        if !self.is_streaming() {
            return Err(SensorError::invalid_state(format!("{} is not streaming", self.name)));
        }
        Ok(())
    }

    /// Refuse new frames and silence the backend. Configuration lock held.
    pub(crate) fn end_streaming(&self, stop_backend: impl FnOnce()) {
        self.context.streaming.store(false, Ordering::Release);
        stop_backend();
        self.context
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Deliver frames already queued and join the dispatch thread.
    ///
    /// Called after `end_streaming` without the configuration lock, so a
    /// user callback touching the sensor cannot deadlock the stop.
    pub(crate) fn drain_dispatch(&self) {
        self.source.stop();
    }

    /// Teardown failures never block resource release; they are logged and
    /// raised as notifications.
    pub(crate) fn report_teardown_failure(&self, what: &str, err: &SensorError) {
        log::warn!("{}: {} failed: {}", self.name, what, err);
        self.context.raise(
            NotificationCategory::HardwareError,
            Severity::Error,
            format!("{}: {} failed: {}", self.name, what, err),
        );
    }
}

impl Drop for SensorBase {
    fn drop(&mut self) {
        self.source.stop();
        self.graph.remove(self.id);
    }
}

/// Capability interface implemented by UVC and HID sensors.
pub trait Sensor: Send + Sync {
    fn base(&self) -> &SensorBase;

    /// Profiles the application may request.
    fn principal_requests(&self) -> Result<Vec<StreamProfile>>;

    /// Bind `requests` and acquire backend resources; all or nothing.
    fn open(&self, requests: &[StreamProfile]) -> Result<Vec<RequestMapping>>;

    fn close(&self) -> Result<()>;

    fn start(&self, callback: FrameCallback) -> Result<()>;

    /// Returns once no frame callback is running or will run. Calling it
    /// from inside the frame callback is an invalid state transition.
    fn stop(&self) -> Result<()>;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn is_streaming(&self) -> bool {
        self.base().is_streaming()
    }

    fn is_opened(&self) -> bool {
        self.base().is_opened()
    }

    fn stream_profiles(&self) -> Result<Arc<Vec<NativeProfile>>> {
        self.base().stream_profiles()
    }

    fn active_configuration(&self) -> Vec<RequestMapping> {
        self.base().active_configuration()
    }

    fn register_notifications_callback(&self, callback: NotificationsCallback) {
        self.base().register_notifications_callback(callback)
    }

    fn extrinsics_to(&self, other: &dyn Sensor) -> Result<Pose> {
        self.base().extrinsics_to(other.base())
    }
}
