//! Voice capture state machine.
//!
//! One press-and-hold gesture drives one capture session:
//! `Idle → Recording → Stopping → Uploading → Idle`, with cancellation
//! (out-of-bounds release, explicit stop) and the too-short rule folding
//! straight back to `Idle`. The session owns the hardware handle for its
//! whole lifetime and releases it exactly once on every exit path.

use crate::audio_toolkit::{encode_wav, save_wav_file, TARGET_SAMPLE_RATE};
use crate::capture::gesture::{ControlBounds, PointerPoint};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventSender, Notice};
use crate::settings::CoreSettings;
use crate::upload_client::{AttachmentUploader, UploadPayload};
use anyhow::Result;
use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// An open hardware audio stream delivering 16 kHz mono f32 samples.
///
/// `stop` resolves only after the hardware has delivered its final
/// samples — the completion future replaces the fixed-delay wait some
/// clients use to paper over the asynchronous stop callback.
pub trait AudioInput: Send + 'static {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> BoxFuture<'_, Result<Vec<f32>>>;
    /// RMS of the most recent samples, for level meters.
    fn level(&self) -> f32;
    /// Release the hardware handle. Must be called exactly once.
    fn close(&mut self);
}

/// Acquires a hardware handle for one capture session.
pub trait AudioInputFactory: Send + Sync + 'static {
    fn open(&self, device_name: Option<&str>) -> Result<Box<dyn AudioInput>, CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Idle,
    Recording,
    Stopping,
    Uploading,
}

enum CaptureState {
    Idle,
    Recording {
        input: Box<dyn AudioInput>,
        bounds: ControlBounds,
        started_at: Instant,
        ticker: JoinHandle<()>,
        ceiling: JoinHandle<()>,
    },
    /// Waiting for the hardware stop callback to deliver final samples.
    Stopping,
    Uploading,
}

impl CaptureState {
    fn status(&self) -> CaptureStatus {
        match self {
            CaptureState::Idle => CaptureStatus::Idle,
            CaptureState::Recording { .. } => CaptureStatus::Recording,
            CaptureState::Stopping => CaptureStatus::Stopping,
            CaptureState::Uploading => CaptureStatus::Uploading,
        }
    }
}

/// Owns the single capture session of the input widget.
#[derive(Clone)]
pub struct CaptureManager {
    state: Arc<Mutex<CaptureState>>,
    factory: Arc<dyn AudioInputFactory>,
    uploader: Arc<dyn AttachmentUploader>,
    events: EventSender,
    settings: Arc<CoreSettings>,
    /// True while the send pipeline (generation or attachment upload)
    /// is busy; starts are rejected for the duration.
    busy_probe: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl CaptureManager {
    pub fn new(
        factory: Arc<dyn AudioInputFactory>,
        uploader: Arc<dyn AttachmentUploader>,
        events: EventSender,
        settings: Arc<CoreSettings>,
        busy_probe: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaptureState::Idle)),
            factory,
            uploader,
            events,
            settings,
            busy_probe,
        }
    }

    pub fn status(&self) -> CaptureStatus {
        self.state.lock().unwrap().status()
    }

    pub fn is_capturing(&self) -> bool {
        self.status() != CaptureStatus::Idle
    }

    /// Begin recording for a press at a control with the given bounds.
    ///
    /// Valid only from `Idle` with the send pipeline quiet; anything else
    /// is a rejected no-op (soft busy notice, `false`). A microphone
    /// acquisition failure is reported and leaves the machine in `Idle`.
    pub fn try_start(&self, bounds: ControlBounds) -> bool {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, CaptureState::Idle) {
            debug!("capture start rejected: session already active");
            self.events.notice(Notice::Busy);
            return false;
        }
        if (self.busy_probe)() {
            debug!("capture start rejected: pipeline busy");
            self.events.notice(Notice::Busy);
            return false;
        }

        let mut input = match self.factory.open(self.settings.selected_microphone.as_deref()) {
            Ok(input) => input,
            Err(e) => {
                error!("microphone unavailable: {e}");
                self.events
                    .emit(CoreEvent::CaptureFailed { message: e.to_string() });
                return false;
            }
        };
        if let Err(e) = input.start() {
            error!("input stream failed to start: {e}");
            input.close();
            self.events
                .emit(CoreEvent::CaptureFailed { message: e.to_string() });
            return false;
        }

        let started_at = Instant::now();
        let ticker = tokio::spawn(Self::tick_loop(self.clone()));
        let ceiling = tokio::spawn(Self::ceiling_watch(self.clone()));

        *state = CaptureState::Recording {
            input,
            bounds,
            started_at,
            ticker,
            ceiling,
        };
        drop(state);

        self.events.emit(CoreEvent::CaptureStarted);
        info!("capture started");
        true
    }

    /// Handle the gesture release: out-of-bounds release cancels, using
    /// the coordinates of the release event itself.
    pub async fn release(&self, point: PointerPoint) {
        let cancel = {
            let state = self.state.lock().unwrap();
            match &*state {
                CaptureState::Recording { bounds, .. } => bounds.release_cancels(point),
                _ => return,
            }
        };
        self.stop(cancel).await;
    }

    /// Stop the active recording. Idempotent: a no-op unless `Recording`.
    ///
    /// `cancel` discards the clip; otherwise the clip is kept when it is
    /// at least the minimum duration, clamped to the maximum, encoded,
    /// and handed to the uploader. Exactly one `VoiceMessageReady` is
    /// emitted per successfully committed capture.
    pub async fn stop(&self, cancel: bool) {
        let (mut input, started_at) = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, CaptureState::Stopping) {
                CaptureState::Recording {
                    input,
                    started_at,
                    ticker,
                    ceiling,
                    ..
                } => {
                    ticker.abort();
                    ceiling.abort();
                    (input, started_at)
                }
                other => {
                    // Not recording: put the state back untouched.
                    *state = other;
                    return;
                }
            }
        };

        let elapsed = started_at.elapsed();

        // Wait for the hardware to confirm the last samples are in, then
        // release the handle no matter what comes next.
        let collected = input.stop().await;
        input.close();

        let samples = match collected {
            Ok(samples) => samples,
            Err(e) => {
                error!("audio stop failed: {e}");
                self.set_idle();
                self.events
                    .emit(CoreEvent::CaptureFailed { message: e.to_string() });
                return;
            }
        };

        if cancel {
            info!("capture cancelled after {elapsed:?}; discarding {} samples", samples.len());
            self.set_idle();
            self.events.notice(Notice::RecordingCancelled);
            return;
        }
        if elapsed < self.settings.min_duration() {
            info!("capture too short ({elapsed:?}); discarding");
            self.set_idle();
            self.events.notice(Notice::RecordingTooShort);
            return;
        }

        let duration_secs = elapsed.min(self.settings.max_duration()).as_secs_f32();
        let wav = match encode_wav(&samples, TARGET_SAMPLE_RATE) {
            Ok(wav) => wav,
            Err(e) => {
                error!("wav encoding failed: {e}");
                self.set_idle();
                self.events
                    .emit(CoreEvent::CaptureFailed { message: e.to_string() });
                return;
            }
        };

        if let Some(dir) = &self.settings.keep_recordings_dir {
            let name = format!("capture-{}.wav", chrono::Utc::now().format("%Y%m%d-%H%M%S%3f"));
            if let Err(e) = save_wav_file(dir.join(name), &samples) {
                warn!("failed to mirror recording to disk: {e}");
            }
        }

        *self.state.lock().unwrap() = CaptureState::Uploading;
        info!(
            "capture committed: {duration_secs:.2}s, {} bytes of wav",
            wav.len()
        );

        let result = self.uploader.upload(UploadPayload::wav(wav)).await;
        self.set_idle();
        match result {
            Ok(uploaded) => {
                self.events.emit(CoreEvent::VoiceMessageReady {
                    url: uploaded.url,
                    duration_secs,
                });
            }
            Err(e) => {
                warn!("voice upload failed: {e}");
                self.events
                    .emit(CoreEvent::UploadFailed { message: e.to_string() });
            }
        }
    }

    /// Forced teardown for host unmount: behaves like a cancelled stop.
    pub async fn shutdown(&self) {
        self.stop(true).await;
    }

    fn set_idle(&self) {
        *self.state.lock().unwrap() = CaptureState::Idle;
    }

    /// Periodic progress tick: elapsed time plus input level. Ends when
    /// the session leaves `Recording`.
    async fn tick_loop(manager: CaptureManager) {
        let interval = manager.settings.capture_tick();
        loop {
            tokio::time::sleep(interval).await;
            let tick = {
                let state = manager.state.lock().unwrap();
                match &*state {
                    CaptureState::Recording {
                        input, started_at, ..
                    } => Some((started_at.elapsed().as_millis() as u64, input.level())),
                    _ => None,
                }
            };
            let Some((elapsed_ms, level)) = tick else { break };
            manager.events.emit(CoreEvent::CaptureTick { elapsed_ms, level });
        }
    }

    /// Hard ceiling: force a normal (non-cancelled) stop at the maximum
    /// duration. The stop runs detached so aborting this watcher from
    /// within `stop` cannot interrupt the teardown it triggered.
    async fn ceiling_watch(manager: CaptureManager) {
        tokio::time::sleep(manager.settings.max_duration()).await;
        debug!("capture ceiling reached; forcing stop");
        tokio::spawn(async move {
            manager.stop(false).await;
        });
    }
}
