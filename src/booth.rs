// The photo booth: owns every component and drives the capture-to-print flow.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraSessionManager, CameraStatus, Facing};
use crate::caption::CaptionAdapter;
use crate::compositor::{CaptureCompositor, StillImage};
use crate::config::PrintConfig;
use crate::entry::PrintEntry;
use crate::errors::{AppError, AppResult, CaptureError, ExportError};
use crate::export::ExportRenderer;
use crate::gallery::{CaptionPatch, GalleryStore};
use crate::scheduler::Scheduler;
use crate::sequencer::{PendingPrint, PrintPhase, PrintSequencer, FRAMES_BEFORE_EJECT};

const EVENT_CAPACITY: usize = 64;

/// Observable booth activity, for whatever renders the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoothEvent {
    ShutterDepressed,
    ShutterReleased,
    FlashOn,
    FlashOff,
    PrintPending { id: String, rotation_deg: f32 },
    EjectionStarted { id: String },
    Committed { id: String },
    CaptionResolved { id: String, caption: String },
    EntryDeleted { id: String },
    GalleryCleared,
    StorageFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ShutterOutcome {
    Admitted { id: String },
    Dropped,
}

/// Gallery listing row; image bytes are served separately.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub id: String,
    pub captured_at: String,
    pub caption: String,
    pub caption_final: bool,
    pub rotation_deg: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoothStatus {
    pub phase: PrintPhase,
    pub progress: f32,
    pub offset_percent: f32,
    pub pending_id: Option<String>,
    pub storage_full: bool,
    pub gallery_len: usize,
    pub camera: CameraStatus,
}

pub struct BoothParts {
    pub camera: CameraSessionManager,
    pub gallery: GalleryStore,
    pub captions: CaptionAdapter,
    pub exporter: ExportRenderer,
    pub scheduler: Arc<dyn Scheduler>,
    pub print: PrintConfig,
    pub export_scale: u32,
}

pub struct PhotoBooth {
    camera: AsyncMutex<CameraSessionManager>,
    sequencer: Mutex<PrintSequencer>,
    gallery: AsyncMutex<GalleryStore>,
    captions: CaptionAdapter,
    exporter: ExportRenderer,
    scheduler: Arc<dyn Scheduler>,
    events: broadcast::Sender<BoothEvent>,
    print: PrintConfig,
    export_scale: u32,
}

impl PhotoBooth {
    pub fn new(parts: BoothParts) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            camera: AsyncMutex::new(parts.camera),
            sequencer: Mutex::new(PrintSequencer::new(parts.print.eject_duration())),
            gallery: AsyncMutex::new(parts.gallery),
            captions: parts.captions,
            exporter: parts.exporter,
            scheduler: parts.scheduler,
            events,
            print: parts.print,
            export_scale: parts.export_scale,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoothEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BoothEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn sequencer(&self) -> MutexGuard<'_, PrintSequencer> {
        self.sequencer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // Camera
    // ========================================================================

    /// Opens the camera at its current facing. Failure leaves capture disabled.
    pub async fn start_camera(&self) -> AppResult<CameraStatus> {
        let mut camera = self.camera.lock().await;
        let facing = camera.facing();
        camera.open(facing).await?;
        Ok(camera.status())
    }

    pub async fn switch_camera(&self, facing: Option<Facing>) -> AppResult<CameraStatus> {
        let mut camera = self.camera.lock().await;
        let next = camera.switch_facing(facing).await?;
        info!("Camera switched to {}", next);
        Ok(camera.status())
    }

    pub async fn camera_status(&self) -> CameraStatus {
        self.camera.lock().await.status()
    }

    pub async fn preview_jpeg(&self) -> Option<Vec<u8>> {
        self.camera.lock().await.latest_jpeg()
    }

    // ========================================================================
    // Shutter and print sequence
    // ========================================================================

    /// Presses the shutter. Presses while a print is in flight are dropped.
    ///
    /// The press runs as its own task: dropping the returned future does not
    /// cancel an admitted press, which still ends in a commit or an abort.
    pub async fn press_shutter(self: &Arc<Self>) -> AppResult<ShutterOutcome> {
        let booth = Arc::clone(self);
        tokio::spawn(booth.run_shutter())
            .await
            .map_err(|e| CaptureError::TaskFailed(e.to_string()))?
    }

    async fn run_shutter(self: Arc<Self>) -> AppResult<ShutterOutcome> {
        if !self.sequencer().try_begin() {
            debug!("Shutter press dropped, print in progress");
            return Ok(ShutterOutcome::Dropped);
        }

        self.spawn_shutter_visuals();
        let captured_local = self.scheduler.now();

        let still = match self.capture_still().await {
            Ok(still) => still,
            Err(e) => {
                warn!("Capture failed, shutter re-enabled: {}", e);
                self.sequencer().abort()?;
                return Err(e);
            }
        };

        let entry = PrintEntry::develop(still, captured_local, self.print.max_tilt_deg);
        let id = entry.id().to_string();
        let rotation_deg = entry.rotation_deg();

        let deadline = self.sequencer().hold(PendingPrint {
            entry,
            captured_local,
            pending_since: self.scheduler.instant(),
        })?;

        info!("Print {} pending", id);
        self.emit(BoothEvent::PrintPending {
            id: id.clone(),
            rotation_deg,
        });

        self.spawn_ejection(id.clone());
        self.spawn_commit(deadline);

        Ok(ShutterOutcome::Admitted { id })
    }

    async fn capture_still(&self) -> AppResult<StillImage> {
        let (frame, facing) = self.camera.lock().await.grab_frame()?;

        let still = tokio::task::spawn_blocking(move || -> AppResult<StillImage> {
            let frame = frame.into_rgb()?;
            Ok(CaptureCompositor::capture(&frame, facing)?)
        })
        .await
        .map_err(|e| CaptureError::TaskFailed(e.to_string()))??;

        debug!("Captured {}px still from {} camera", still.side(), facing);
        Ok(still)
    }

    fn spawn_shutter_visuals(self: &Arc<Self>) {
        let booth = Arc::clone(self);
        tokio::spawn(async move {
            let start = booth.scheduler.instant();
            booth.emit(BoothEvent::ShutterDepressed);
            booth.emit(BoothEvent::FlashOn);

            let release = start + booth.print.shutter_depress();
            let flash_off = start + booth.print.flash_duration();
            let (first, second) = if release <= flash_off {
                ((release, BoothEvent::ShutterReleased), (flash_off, BoothEvent::FlashOff))
            } else {
                ((flash_off, BoothEvent::FlashOff), (release, BoothEvent::ShutterReleased))
            };

            booth.scheduler.sleep_until(first.0).await;
            booth.emit(first.1);
            booth.scheduler.sleep_until(second.0).await;
            booth.emit(second.1);
        });
    }

    fn spawn_ejection(self: &Arc<Self>, id: String) {
        let booth = Arc::clone(self);
        tokio::spawn(async move {
            for _ in 0..FRAMES_BEFORE_EJECT {
                booth.scheduler.next_frame().await;
                let started = booth.sequencer().frame_tick(booth.scheduler.instant());
                if started {
                    debug!("Print {} ejecting", id);
                    booth.emit(BoothEvent::EjectionStarted { id });
                    return;
                }
            }
        });
    }

    fn spawn_commit(self: &Arc<Self>, deadline: Instant) {
        let booth = Arc::clone(self);
        tokio::spawn(async move {
            booth.scheduler.sleep_until(deadline).await;
            booth.commit_pending().await;
        });
    }

    async fn commit_pending(self: &Arc<Self>) {
        let committed = self.sequencer().commit(self.scheduler.instant());
        let print = match committed {
            Ok(print) => print,
            Err(e) => {
                error!("Print commit rejected: {}", e);
                return;
            }
        };

        let id = print.entry.id().to_string();
        let jpeg = print.entry.image_data().to_vec();

        let appended = {
            let mut gallery = self.gallery.lock().await;
            let was_full = gallery.storage_full();
            let appended = gallery.append(print.entry).await;
            self.report_storage(was_full, gallery.storage_full());
            appended
        };
        if !appended {
            return;
        }

        info!("Print {} committed to gallery", id);
        self.emit(BoothEvent::Committed { id: id.clone() });
        self.spawn_caption(id, jpeg, print.captured_local);
    }

    /// Captions run detached; a late result for a deleted entry is dropped.
    fn spawn_caption(self: &Arc<Self>, id: String, jpeg: Vec<u8>, captured_local: DateTime<Local>) {
        let booth = Arc::clone(self);
        tokio::spawn(async move {
            let caption = booth.captions.describe(&jpeg, captured_local).await;

            let mut gallery = booth.gallery.lock().await;
            let was_full = gallery.storage_full();
            let patch = gallery.resolve_caption(&id, &caption).await;
            match patch {
                CaptionPatch::Applied => {
                    booth.report_storage(was_full, gallery.storage_full());
                    drop(gallery);
                    debug!("Caption for {}: {}", id, caption);
                    booth.emit(BoothEvent::CaptionResolved { id, caption });
                }
                CaptionPatch::AlreadyFinal => {
                    warn!("Caption for {} was already final", id);
                }
                CaptionPatch::Missing => {
                    debug!("Discarding caption for deleted print {}", id);
                }
            }
        });
    }

    fn report_storage(&self, was_full: bool, is_full: bool) {
        if is_full && !was_full {
            warn!("Gallery storage is full; new prints are kept in memory only");
            self.emit(BoothEvent::StorageFull);
        }
    }

    pub async fn status(&self) -> BoothStatus {
        let (phase, progress, offset_percent, pending_id) = {
            let sequencer = self.sequencer();
            let now = self.scheduler.instant();
            (
                sequencer.phase(),
                sequencer.progress(now),
                sequencer.offset_percent(now),
                sequencer.pending().map(|print| print.entry.id().to_string()),
            )
        };

        let (storage_full, gallery_len) = {
            let gallery = self.gallery.lock().await;
            (gallery.storage_full(), gallery.len())
        };

        BoothStatus {
            phase,
            progress,
            offset_percent,
            pending_id,
            storage_full,
            gallery_len,
            camera: self.camera_status().await,
        }
    }

    // ========================================================================
    // Gallery
    // ========================================================================

    pub async fn list(&self) -> Vec<EntrySummary> {
        let placeholder = self.captions.placeholder();
        self.gallery
            .lock()
            .await
            .list()
            .map(|entry| EntrySummary {
                id: entry.id().to_string(),
                captured_at: entry.captured_at().to_string(),
                caption: entry.caption().text(placeholder).to_string(),
                caption_final: entry.caption().is_final(),
                rotation_deg: entry.rotation_deg(),
            })
            .collect()
    }

    pub async fn entry(&self, id: &str) -> AppResult<PrintEntry> {
        self.gallery
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound { id: id.to_string() })
    }

    pub async fn remove(&self, id: &str) -> AppResult<()> {
        let mut gallery = self.gallery.lock().await;
        let was_full = gallery.storage_full();
        if gallery.remove(id).await.is_none() {
            return Err(AppError::NotFound { id: id.to_string() });
        }
        self.report_storage(was_full, gallery.storage_full());
        drop(gallery);

        info!("Print {} deleted", id);
        self.emit(BoothEvent::EntryDeleted { id: id.to_string() });
        Ok(())
    }

    pub async fn clear(&self) {
        self.gallery.lock().await.clear().await;
        info!("Gallery cleared");
        self.emit(BoothEvent::GalleryCleared);
    }

    /// Renders a committed print for download; defaults to the configured scale.
    pub async fn export(self: &Arc<Self>, id: &str, scale: Option<u32>) -> AppResult<Vec<u8>> {
        let entry = self.entry(id).await?;
        let scale = scale.unwrap_or(self.export_scale);

        let booth = Arc::clone(self);
        let jpeg = tokio::task::spawn_blocking(move || booth.exporter.render(&entry, scale))
            .await
            .map_err(|e| ExportError::TaskFailed(e.to_string()))??;
        Ok(jpeg)
    }

    pub async fn shutdown(&self) {
        info!("Closing camera session");
        self.camera.lock().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{SyntheticCamera, SyntheticFailure};
    use crate::caption::CaptionService;
    use crate::config::CaptionConfig;
    use crate::entry::Caption;
    use crate::errors::{CameraError, CaptionError};
    use crate::gallery::MemoryPersistence;
    use crate::scheduler::{AnchoredScheduler, TokioScheduler};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::time::Duration;

    struct SlowCaptions {
        delay: Duration,
        reply: Result<&'static str, ()>,
        instructions: Mutex<Vec<String>>,
    }

    impl SlowCaptions {
        fn new(delay_ms: u64, reply: Result<&'static str, ()>) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                reply,
                instructions: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.instructions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CaptionService for SlowCaptions {
        async fn describe(&self, _jpeg: &[u8], instruction: &str) -> Result<String, CaptionError> {
            self.instructions.lock().unwrap().push(instruction.to_string());
            tokio::time::sleep(self.delay).await;
            match self.reply {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(CaptionError::Status {
                    status: 503,
                    body: "overloaded".to_string(),
                }),
            }
        }

        fn type_name(&self) -> &'static str {
            "Slow"
        }
    }

    fn wall_t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 10, 18, 14, 30, 0).unwrap()
    }

    async fn booth_with(
        camera: Arc<SyntheticCamera>,
        captions: Arc<SlowCaptions>,
        persistence: Arc<MemoryPersistence>,
    ) -> Arc<PhotoBooth> {
        let print = PrintConfig::default();
        let booth = PhotoBooth::new(BoothParts {
            camera: CameraSessionManager::new(camera, 1280, Facing::Back),
            gallery: GalleryStore::load(persistence).await,
            captions: CaptionAdapter::new(captions, CaptionConfig::default()),
            exporter: ExportRenderer::without_font("developing…"),
            scheduler: Arc::new(AnchoredScheduler::starting_at(
                wall_t0(),
                print.frame_interval(),
            )),
            print,
            export_scale: 4,
        });
        booth.start_camera().await.unwrap();
        booth
    }

    async fn default_booth(captions: Arc<SlowCaptions>) -> Arc<PhotoBooth> {
        booth_with(
            Arc::new(SyntheticCamera::new(1920, 1080)),
            captions,
            Arc::new(MemoryPersistence::default()),
        )
        .await
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn admitted_id(outcome: ShutterOutcome) -> String {
        match outcome {
            ShutterOutcome::Admitted { id } => id,
            ShutterOutcome::Dropped => panic!("shutter press was dropped"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_capture_commit_caption() {
        let captions = SlowCaptions::new(1200, Ok("14:30 studio portrait"));
        let booth = default_booth(captions.clone()).await;
        let mut events = booth.subscribe();

        let id = admitted_id(booth.press_shutter().await.unwrap());
        let t0 = Instant::now();

        // Still held by the sequencer, not in the gallery
        {
            let sequencer = booth.sequencer();
            let pending = sequencer.pending().unwrap();
            assert_eq!(pending.entry.id(), id);
            assert_eq!(pending.entry.caption(), &Caption::Developing);
            let still = image::load_from_memory(pending.entry.image_data()).unwrap();
            assert_eq!((still.width(), still.height()), (1080, 1080));
            assert!((-3.0..=3.0).contains(&pending.entry.rotation_deg()));
        }

        tokio::time::sleep_until(t0 + Duration::from_millis(3499)).await;
        settle().await;
        assert_eq!(booth.status().await.gallery_len, 0);
        assert_eq!(booth.status().await.phase, PrintPhase::Ejecting);

        tokio::time::sleep_until(t0 + Duration::from_millis(3501)).await;
        settle().await;
        let status = booth.status().await;
        assert_eq!(status.gallery_len, 1);
        assert_eq!(status.phase, PrintPhase::Idle);

        let listed = booth.list().await;
        assert_eq!(listed[0].caption, "developing…");
        assert!(!listed[0].caption_final);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        settle().await;
        let entry = booth.entry(&id).await.unwrap();
        assert_eq!(
            entry.caption(),
            &Caption::Final("14:30 studio portrait".to_string())
        );

        let calls = captions.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("14:30"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&BoothEvent::FlashOn));
        assert!(seen.contains(&BoothEvent::FlashOff));
        assert!(seen.contains(&BoothEvent::EjectionStarted { id: id.clone() }));
        assert!(seen.contains(&BoothEvent::Committed { id: id.clone() }));
        assert!(seen.contains(&BoothEvent::CaptionResolved {
            id,
            caption: "14:30 studio portrait".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presses_while_busy_are_dropped() {
        let booth = default_booth(SlowCaptions::new(10, Ok("ok"))).await;

        admitted_id(booth.press_shutter().await.unwrap());
        for _ in 0..5 {
            assert_eq!(booth.press_shutter().await.unwrap(), ShutterOutcome::Dropped);
        }

        tokio::time::sleep(Duration::from_millis(4000)).await;
        settle().await;
        assert_eq!(booth.status().await.gallery_len, 1);

        // Idle again, so the next press is admitted
        admitted_id(booth.press_shutter().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_press_still_commits() {
        let booth = default_booth(SlowCaptions::new(10, Ok("ok"))).await;

        // Poll the press once, then let the caller go away mid-capture
        let mut press = Box::pin(booth.press_shutter());
        tokio::select! {
            biased;
            _ = &mut press => panic!("press finished on its first poll"),
            _ = std::future::ready(()) => {}
        }
        drop(press);

        tokio::time::sleep(Duration::from_millis(4000)).await;
        settle().await;
        let status = booth.status().await;
        assert_eq!(status.phase, PrintPhase::Idle);
        assert_eq!(status.gallery_len, 1);

        admitted_id(booth.press_shutter().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_entry_ignores_late_caption() {
        let captions = SlowCaptions::new(1200, Ok("late caption"));
        let persistence = Arc::new(MemoryPersistence::default());
        let booth = booth_with(
            Arc::new(SyntheticCamera::new(640, 480)),
            captions.clone(),
            persistence.clone(),
        )
        .await;

        let id = admitted_id(booth.press_shutter().await.unwrap());
        tokio::time::sleep(Duration::from_millis(3600)).await;
        settle().await;
        booth.remove(&id).await.unwrap();
        let writes = persistence.write_count();

        tokio::time::sleep(Duration::from_millis(2000)).await;
        settle().await;
        assert_eq!(captions.calls().len(), 1);
        assert!(booth.list().await.is_empty());
        assert!(matches!(
            booth.entry(&id).await,
            Err(AppError::NotFound { .. })
        ));
        assert_eq!(persistence.write_count(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caption_failure_uses_fallback() {
        let booth = default_booth(SlowCaptions::new(50, Err(()))).await;
        let id = admitted_id(booth.press_shutter().await.unwrap());

        tokio::time::sleep(Duration::from_millis(4000)).await;
        settle().await;
        let entry = booth.entry(&id).await.unwrap();
        assert_eq!(entry.caption(), &Caption::Final("A lovely moment".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_returns_to_idle() {
        let booth = default_booth(SlowCaptions::new(10, Ok("ok"))).await;
        booth.shutdown().await;

        let err = booth.press_shutter().await.unwrap_err();
        assert!(matches!(err, AppError::Camera(CameraError::NoActiveSession)));
        assert_eq!(booth.status().await.phase, PrintPhase::Idle);

        booth.start_camera().await.unwrap();
        admitted_id(booth.press_shutter().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_error_is_reported_inline() {
        let captions = SlowCaptions::new(10, Ok("ok"));
        let print = PrintConfig::default();
        let booth = PhotoBooth::new(BoothParts {
            camera: CameraSessionManager::new(
                Arc::new(SyntheticCamera::failing(SyntheticFailure::PermissionDenied)),
                1280,
                Facing::Back,
            ),
            gallery: GalleryStore::load(Arc::new(MemoryPersistence::default())).await,
            captions: CaptionAdapter::new(captions, CaptionConfig::default()),
            exporter: ExportRenderer::without_font("developing…"),
            scheduler: Arc::new(TokioScheduler::new(print.frame_interval())),
            print,
            export_scale: 4,
        });

        assert!(booth.start_camera().await.is_err());
        let status = booth.camera_status().await;
        assert!(!status.active);
        assert!(status.error.is_some());
        assert!(booth.press_shutter().await.is_err());
        assert!(booth.sequencer().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_full_still_commits() {
        let persistence = Arc::new(MemoryPersistence::default());
        persistence.set_fail_writes(true);
        let booth = booth_with(
            Arc::new(SyntheticCamera::new(320, 240)),
            SlowCaptions::new(10, Ok("ok")),
            persistence.clone(),
        )
        .await;
        let mut events = booth.subscribe();

        admitted_id(booth.press_shutter().await.unwrap());
        tokio::time::sleep(Duration::from_millis(4000)).await;
        settle().await;

        let status = booth.status().await;
        assert_eq!(status.gallery_len, 1);
        assert!(status.storage_full);

        let mut full_events = 0;
        while let Ok(event) = events.try_recv() {
            if event == BoothEvent::StorageFull {
                full_events += 1;
            }
        }
        assert_eq!(full_events, 1);

        // Clearing cannot persist either, so the warning stays up
        booth.clear().await;
        assert!(booth.status().await.storage_full);

        persistence.set_fail_writes(false);
        booth.clear().await;
        assert!(!booth.status().await.storage_full);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_committed_entry() {
        let booth = default_booth(SlowCaptions::new(10, Ok("ok"))).await;
        let id = admitted_id(booth.press_shutter().await.unwrap());
        tokio::time::sleep(Duration::from_millis(4000)).await;
        settle().await;

        let jpeg = booth.export(&id, Some(1)).await.unwrap();
        let card = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((card.width(), card.height()), (256, 320));

        assert!(matches!(
            booth.export("missing", None).await,
            Err(AppError::NotFound { .. })
        ));
        assert!(matches!(
            booth.export(&id, Some(0)).await,
            Err(AppError::Export(ExportError::InvalidDimensions(_)))
        ));
    }
}
