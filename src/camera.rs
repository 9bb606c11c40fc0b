// Camera functionality module
// Owns the live device stream and hands decoded frames to the compositor.

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use crate::config::{CameraBackend, CameraConfig};
use crate::errors::{CameraError, ConfigError};
use crate::vintage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
}

impl Facing {
    pub fn toggled(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        }
    }

    /// Front-facing previews are shown mirrored, so stills must be too.
    pub fn is_mirrored(self) -> bool {
        matches!(self, Facing::Front)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Facing::Front => "front",
            Facing::Back => "back",
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Facing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "front" | "user" | "selfie" => Ok(Facing::Front),
            "back" | "rear" | "environment" => Ok(Facing::Back),
            _ => Err(ConfigError::InvalidFacing {
                value: s.to_string(),
            }),
        }
    }
}

/// Video-only stream request: a facing mode plus a resolution hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConstraints {
    pub facing: Facing,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl StreamConstraints {
    pub fn square(facing: Facing, size: u32) -> Self {
        Self {
            facing,
            ideal_width: size,
            ideal_height: size,
        }
    }
}

/// A frame as the device delivered it, before any decoding.
#[derive(Debug, Clone)]
pub enum RawFrame {
    Jpeg(Vec<u8>),
    Rgb(RgbImage),
}

impl RawFrame {
    /// CPU-bound for JPEG frames; call from a blocking thread.
    pub fn into_rgb(self) -> Result<RgbImage, CameraError> {
        match self {
            RawFrame::Jpeg(jpeg) => decode_jpeg_frame(&jpeg),
            RawFrame::Rgb(frame) => Ok(frame),
        }
    }
}

/// A running video track. Stopping it releases the hardware.
pub trait VideoTrack: Send {
    fn facing(&self) -> Facing;

    /// Most recent encoded frame, if the device has produced one yet.
    fn latest_jpeg(&self) -> Option<Vec<u8>>;

    fn latest_frame(&self) -> Result<RawFrame, CameraError> {
        self.latest_jpeg()
            .map(RawFrame::Jpeg)
            .ok_or(CameraError::NoFrameAvailable)
    }

    /// May block until the device lets go; not for async contexts.
    fn stop(&mut self);
}

#[async_trait]
pub trait CameraDevice: Send + Sync {
    async fn open(&self, constraints: StreamConstraints)
        -> Result<Box<dyn VideoTrack>, CameraError>;
    fn type_name(&self) -> &'static str;
}

pub fn decode_jpeg_frame(jpeg: &[u8]) -> Result<RgbImage, CameraError> {
    image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| CameraError::FrameDecode(e.to_string()))
}

pub struct CameraSession {
    track: Box<dyn VideoTrack>,
}

impl CameraSession {
    pub fn facing(&self) -> Facing {
        self.track.facing()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub facing: Facing,
    pub active: bool,
    pub device: &'static str,
    pub error: Option<String>,
}

/// Exclusive owner of the single active camera session.
pub struct CameraSessionManager {
    device: Arc<dyn CameraDevice>,
    ideal_size: u32,
    facing: Facing,
    session: Option<CameraSession>,
    last_error: Option<String>,
}

impl CameraSessionManager {
    pub fn new(device: Arc<dyn CameraDevice>, ideal_size: u32, facing: Facing) -> Self {
        Self {
            device,
            ideal_size,
            facing,
            session: None,
            last_error: None,
        }
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Opens a session for `facing`, stopping any existing one first.
    ///
    /// Failures are recorded for display and returned; there is no retry.
    pub async fn open(&mut self, facing: Facing) -> Result<&CameraSession, CameraError> {
        self.close().await;
        self.facing = facing;

        let constraints = StreamConstraints::square(facing, self.ideal_size);
        info!(
            "Opening {} camera via {} ({}x{} ideal)",
            facing,
            self.device.type_name(),
            constraints.ideal_width,
            constraints.ideal_height
        );

        match self.device.open(constraints).await {
            Ok(track) => {
                self.last_error = None;
                let session = self.session.insert(CameraSession { track });
                Ok(&*session)
            }
            Err(e) => {
                warn!("Camera open failed for {} camera: {}", facing, e);
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Stops the active track on a blocking thread and waits for it.
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let facing = session.facing();
        let mut track = session.track;

        match tokio::task::spawn_blocking(move || track.stop()).await {
            Ok(()) => info!("Closed {} camera session", facing),
            Err(e) => warn!("Stopping {} camera failed: {}", facing, e),
        }
    }

    /// Switches to `requested`, or to the opposite facing when `None`.
    pub async fn switch_facing(&mut self, requested: Option<Facing>) -> Result<Facing, CameraError> {
        let next = requested.unwrap_or_else(|| self.facing.toggled());
        self.open(next).await.map(CameraSession::facing)
    }

    /// Latest frame, undecoded.
    pub fn grab_frame(&self) -> Result<(RawFrame, Facing), CameraError> {
        let session = self.session.as_ref().ok_or(CameraError::NoActiveSession)?;
        let frame = session.track.latest_frame()?;
        Ok((frame, session.facing()))
    }

    pub fn latest_jpeg(&self) -> Option<Vec<u8>> {
        self.session
            .as_ref()
            .and_then(|session| session.track.latest_jpeg())
    }

    pub fn status(&self) -> CameraStatus {
        CameraStatus {
            facing: self.facing,
            active: self.session.is_some(),
            device: self.device.type_name(),
            error: self.last_error.clone(),
        }
    }
}

impl Drop for CameraSessionManager {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let mut track = session.track;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || track.stop());
            }
            Err(_) => track.stop(),
        }
    }
}

// Factory for the configured device backend
pub fn new_camera_device(config: &CameraConfig) -> Arc<dyn CameraDevice> {
    match config.backend {
        #[cfg(target_os = "linux")]
        CameraBackend::V4l => Arc::new(V4lCamera::from_config(config)),
        #[cfg(not(target_os = "linux"))]
        CameraBackend::V4l => {
            warn!("V4L2 cameras are only supported on Linux, using synthetic camera");
            Arc::new(SyntheticCamera::new(1920, 1080))
        }
        CameraBackend::Synthetic => Arc::new(SyntheticCamera::new(1920, 1080)),
    }
}

// ============================================================================
// Synthetic camera
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticFailure {
    PermissionDenied,
    NoDevice,
    Unsatisfiable,
}

/// Deterministic frame source for machines without a camera, and for tests.
pub struct SyntheticCamera {
    frame: RgbImage,
    failure: Option<SyntheticFailure>,
    live_tracks: Arc<AtomicUsize>,
    peak_tracks: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_frame(Self::test_pattern(width, height))
    }

    pub fn with_frame(frame: RgbImage) -> Self {
        Self {
            frame,
            failure: None,
            live_tracks: Arc::new(AtomicUsize::new(0)),
            peak_tracks: Arc::new(AtomicUsize::new(0)),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn failing(failure: SyntheticFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(16, 16)
        }
    }

    /// Horizontal and vertical ramps, so mirroring and cropping are observable.
    pub fn test_pattern(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            Rgb([r, g, 96])
        })
    }

    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    pub fn peak_tracks(&self) -> usize {
        self.peak_tracks.load(Ordering::SeqCst)
    }

    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraDevice for SyntheticCamera {
    async fn open(
        &self,
        constraints: StreamConstraints,
    ) -> Result<Box<dyn VideoTrack>, CameraError> {
        let device = format!("synthetic:{}", constraints.facing);
        match self.failure {
            Some(SyntheticFailure::PermissionDenied) => {
                return Err(CameraError::PermissionDenied { device })
            }
            Some(SyntheticFailure::NoDevice) => return Err(CameraError::DeviceNotFound { device }),
            Some(SyntheticFailure::Unsatisfiable) => {
                return Err(CameraError::ConstraintsUnsatisfiable(format!(
                    "{}x{} not offered by {}",
                    constraints.ideal_width, constraints.ideal_height, device
                )))
            }
            None => {}
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.live_tracks.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_tracks.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(SyntheticTrack {
            facing: constraints.facing,
            frame: self.frame.clone(),
            jpeg: OnceLock::new(),
            live_tracks: self.live_tracks.clone(),
            stopped: false,
        }))
    }

    fn type_name(&self) -> &'static str {
        "Synthetic Camera"
    }
}

struct SyntheticTrack {
    facing: Facing,
    frame: RgbImage,
    jpeg: OnceLock<Option<Vec<u8>>>,
    live_tracks: Arc<AtomicUsize>,
    stopped: bool,
}

impl VideoTrack for SyntheticTrack {
    fn facing(&self) -> Facing {
        self.facing
    }

    fn latest_jpeg(&self) -> Option<Vec<u8>> {
        if self.stopped {
            return None;
        }
        self.jpeg
            .get_or_init(|| vintage::encode_jpeg(&self.frame, 80).ok())
            .clone()
    }

    // Raw pixels, so stills are not degraded by a preview encode.
    fn latest_frame(&self) -> Result<RawFrame, CameraError> {
        if self.stopped {
            return Err(CameraError::NoFrameAvailable);
        }
        Ok(RawFrame::Rgb(self.frame.clone()))
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live_tracks.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// V4L2 camera
// ============================================================================

#[cfg(target_os = "linux")]
pub use v4l_backend::V4lCamera;

#[cfg(target_os = "linux")]
mod v4l_backend {
    use super::{CameraDevice, Facing, StreamConstraints, VideoTrack};
    use crate::config::CameraConfig;
    use crate::errors::CameraError;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tracing::{debug, info, warn};
    use v4l::buffer::Type;
    use v4l::device::Device;
    use v4l::io::traits::CaptureStream;
    use v4l::io::userptr;
    use v4l::video::Capture;
    use v4l::{Format, FourCC};

    /// Upper bound on how long the capture loop waits for a buffer before
    /// rechecking its stop flag.
    const POLL_TIMEOUT: Duration = Duration::from_millis(250);

    /// MJPEG webcams addressed by device node, one per facing direction.
    pub struct V4lCamera {
        back_device: String,
        front_device: String,
    }

    impl V4lCamera {
        pub fn new(back_device: impl Into<String>, front_device: impl Into<String>) -> Self {
            Self {
                back_device: back_device.into(),
                front_device: front_device.into(),
            }
        }

        pub fn from_config(config: &CameraConfig) -> Self {
            Self::new(config.back_device.clone(), config.front_device.clone())
        }

        fn device_for(&self, facing: Facing) -> &str {
            match facing {
                Facing::Back => &self.back_device,
                Facing::Front => &self.front_device,
            }
        }
    }

    #[async_trait]
    impl CameraDevice for V4lCamera {
        async fn open(
            &self,
            constraints: StreamConstraints,
        ) -> Result<Box<dyn VideoTrack>, CameraError> {
            let path = self.device_for(constraints.facing).to_string();
            let last_frame = Arc::new(Mutex::new(None));
            let running = Arc::new(AtomicBool::new(true));
            let (ready_tx, ready_rx) = oneshot::channel();

            let worker = {
                let last_frame = last_frame.clone();
                let running = running.clone();
                let path = path.clone();
                std::thread::Builder::new()
                    .name(format!("v4l-{}", constraints.facing))
                    .spawn(move || preview_loop(path, constraints, ready_tx, last_frame, running))?
            };

            match ready_rx.await {
                Ok(Ok(())) => Ok(Box::new(V4lTrack {
                    facing: constraints.facing,
                    last_frame,
                    running,
                    worker: Some(worker),
                })),
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(e)
                }
                Err(_) => Err(CameraError::StreamStartError(format!(
                    "capture thread for {} exited before the stream started",
                    path
                ))),
            }
        }

        fn type_name(&self) -> &'static str {
            "V4L2 Camera"
        }
    }

    struct V4lTrack {
        facing: Facing,
        last_frame: Arc<Mutex<Option<Vec<u8>>>>,
        running: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
    }

    impl VideoTrack for V4lTrack {
        fn facing(&self) -> Facing {
            self.facing
        }

        fn latest_jpeg(&self) -> Option<Vec<u8>> {
            self.last_frame.lock().ok().and_then(|frame| frame.clone())
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::Release);
            // The loop notices the flag within one poll timeout.
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    warn!("V4L2 capture thread panicked");
                }
            }
        }
    }

    impl Drop for V4lTrack {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn map_open_error(path: &str, e: io::Error) -> CameraError {
        match e.kind() {
            io::ErrorKind::NotFound => CameraError::DeviceNotFound {
                device: path.to_string(),
            },
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied {
                device: path.to_string(),
            },
            _ => CameraError::OpenFailed(format!("{}: {}", path, e)),
        }
    }

    fn configure_device(
        dev: &mut Device,
        constraints: StreamConstraints,
    ) -> Result<Format, CameraError> {
        let mut fmt = dev
            .format()
            .map_err(|e| CameraError::OpenFailed(format!("format(): {e}")))?;
        fmt.width = constraints.ideal_width;
        fmt.height = constraints.ideal_height;
        fmt.fourcc = FourCC::new(b"MJPG");

        let fmt = dev
            .set_format(&fmt)
            .map_err(|e| CameraError::ConstraintsUnsatisfiable(format!("set_format(): {e}")))?;

        if fmt.fourcc != FourCC::new(b"MJPG") {
            return Err(CameraError::ConstraintsUnsatisfiable(format!(
                "device offers {} instead of MJPEG",
                fmt.fourcc
            )));
        }

        Ok(fmt)
    }

    fn preview_loop(
        path: String,
        constraints: StreamConstraints,
        ready: oneshot::Sender<Result<(), CameraError>>,
        last_frame: Arc<Mutex<Option<Vec<u8>>>>,
        running: Arc<AtomicBool>,
    ) {
        let mut dev = match Device::with_path(&path) {
            Ok(dev) => dev,
            Err(e) => {
                let _ = ready.send(Err(map_open_error(&path, e)));
                return;
            }
        };

        let fmt = match configure_device(&mut dev, constraints) {
            Ok(fmt) => fmt,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        let mut stream = match userptr::Stream::with_buffers(&mut dev, Type::VideoCapture, 4) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(CameraError::StreamStartError(format!(
                    "Failed to create UserptrStream: {e}"
                ))));
                return;
            }
        };

        stream.set_timeout(POLL_TIMEOUT);

        info!(
            "Streaming {} at {}x{} ({} requested)",
            path, fmt.width, fmt.height, constraints.ideal_width
        );
        if ready.send(Ok(())).is_err() {
            return;
        }

        let mut frame_count = 0usize;
        while running.load(Ordering::Acquire) {
            match stream.next() {
                Ok((buffer, _meta)) => {
                    frame_count += 1;
                    if let Ok(mut lf) = last_frame.lock() {
                        *lf = Some(buffer.to_vec());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    warn!("Userptr stream error on {}: {}", path, e);
                    break;
                }
            }
        }

        debug!("Capture loop for {} stopped after {} frames", path, frame_count);
    }
}
