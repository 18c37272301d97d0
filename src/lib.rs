//! Conversational streaming and voice-capture core.
//!
//! The crate owns the two hard pipelines of the client: turning a
//! press-and-hold gesture into a bounded, uploaded audio clip, and
//! consuming a server-pushed token stream into incrementally rendered
//! assistant messages — with single-flight guarantees, cooperative
//! cancellation, and no leaked timers or hardware handles. Screens,
//! persistence, and session CRUD live in the host application.

pub mod audio_toolkit;
pub mod capture;
pub mod error;
pub mod events;
pub mod settings;
pub mod stream_client;
pub mod streaming;
pub mod transcript;
pub mod upload_client;

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::audio_toolkit::CpalInputFactory;
use crate::capture::machine::AudioInputFactory;
use crate::capture::{CaptureManager, CaptureStatus, ControlBounds, PointerPoint};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventSender, Notice};
use crate::settings::CoreSettings;
use crate::stream_client::HttpChatTransport;
use crate::streaming::session::ChatTransport;
use crate::streaming::{GenerationManager, OutgoingContent};
use crate::transcript::{ConversationStore, MessageId};
use crate::upload_client::{AttachmentUploader, HttpUploader, UploadPayload};

pub use crate::error::{TransportError, UploadError};
pub use crate::events::Notice as CoreNotice;
pub use crate::streaming::STOPPED_MARKER;
pub use crate::transcript::{Message, MessageContent, Role};

/// The assembled core: one conversation store, one capture widget, any
/// number of per-conversation generation sessions.
pub struct ChatCore {
    store: Arc<ConversationStore>,
    events: EventSender,
    uploader: Arc<dyn AttachmentUploader>,
    generation: GenerationManager,
    capture: CaptureManager,
}

impl ChatCore {
    /// Wire the core against the real HTTP and microphone backends.
    pub fn new(settings: CoreSettings) -> Result<(Self, UnboundedReceiver<CoreEvent>), CoreError> {
        let transport =
            HttpChatTransport::new(&settings.api_base_url, settings.auth_token.as_deref())?;
        let uploader = HttpUploader::new(&settings.api_base_url, settings.auth_token.clone());
        Ok(Self::with_parts(
            settings,
            Arc::new(transport),
            Arc::new(uploader),
            Arc::new(CpalInputFactory),
        ))
    }

    /// Wire the core against caller-supplied backends (tests, previews).
    pub fn with_parts(
        settings: CoreSettings,
        transport: Arc<dyn ChatTransport>,
        uploader: Arc<dyn AttachmentUploader>,
        input_factory: Arc<dyn AudioInputFactory>,
    ) -> (Self, UnboundedReceiver<CoreEvent>) {
        let (events, rx) = EventSender::channel();
        let settings = Arc::new(settings);
        let store = Arc::new(ConversationStore::new(events.clone()));
        let generation = GenerationManager::new(
            store.clone(),
            transport,
            events.clone(),
            settings.render_debounce(),
        );
        // The generation flag doubles as the capture-side gate: no new
        // recording while a reply is still streaming.
        let busy_probe = {
            let generation = generation.clone();
            Arc::new(move || generation.is_any_active()) as Arc<dyn Fn() -> bool + Send + Sync>
        };
        let capture = CaptureManager::new(
            input_factory,
            uploader.clone(),
            events.clone(),
            settings,
            busy_probe,
        );

        (
            Self {
                store,
                events,
                uploader,
                generation,
                capture,
            },
            rx,
        )
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Send a text message and open its streamed generation.
    pub fn send_text(&self, session_id: &str, text: &str) -> Result<MessageId, CoreError> {
        self.generation
            .request(session_id, OutgoingContent::Text(text.to_string()))
    }

    /// Upload an image, then send it and open its streamed generation.
    ///
    /// The originating control must stay disabled until this resolves;
    /// the coordinator itself performs no retry.
    pub async fn send_image(
        &self,
        session_id: &str,
        bytes: Vec<u8>,
        content_type: &str,
        file_name: &str,
    ) -> Result<MessageId, CoreError> {
        if self.generation.is_active(session_id) {
            self.events.notice(Notice::Busy);
            return Err(CoreError::Busy);
        }

        let payload = UploadPayload {
            bytes,
            content_type: content_type.to_string(),
            file_name: file_name.to_string(),
        };
        let uploaded = match self.uploader.upload(payload).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                self.events.emit(CoreEvent::UploadFailed {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.generation
            .request(session_id, OutgoingContent::Image { url: uploaded.url })
    }

    /// Send a committed voice clip (from `VoiceMessageReady`) and open its
    /// streamed generation. `content` on the wire is null for voice sends.
    pub fn send_voice(
        &self,
        session_id: &str,
        audio_url: &str,
        duration_secs: f32,
    ) -> Result<MessageId, CoreError> {
        self.generation.request(
            session_id,
            OutgoingContent::Voice {
                url: audio_url.to_string(),
                duration_secs,
            },
        )
    }

    /// Press on the record control: start capturing.
    pub fn press_record(&self, bounds: ControlBounds) -> bool {
        self.capture.try_start(bounds)
    }

    /// Release of the record gesture, with the release coordinates.
    pub async fn release_record(&self, point: PointerPoint) {
        self.capture.release(point).await;
    }

    pub fn capture_status(&self) -> CaptureStatus {
        self.capture.status()
    }

    pub fn is_generating(&self, session_id: &str) -> bool {
        self.generation.is_active(session_id)
    }

    /// Stop the generation for one conversation, keeping partial output.
    pub fn stop_generation(&self, session_id: &str) -> bool {
        self.generation.cancel(session_id)
    }

    /// The single user-facing stop action. Safe to call at any time:
    /// cancels every live generation (partial text is kept, with the
    /// stopped marker) and discards any in-progress recording.
    pub async fn stop_all(&self) {
        self.generation.cancel_all();
        self.capture.stop(true).await;
    }

    /// Forced teardown for host unmount. Equivalent to [`stop_all`](Self::stop_all).
    pub async fn shutdown(&self) {
        self.generation.cancel_all();
        self.capture.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::machine::AudioInput;
    use crate::error::TransportError;
    use crate::streaming::session::{ByteStream, StreamRequest};
    use anyhow::Result;
    use futures_util::future::BoxFuture;
    use futures_util::{FutureExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const BOUNDS: ControlBounds = ControlBounds {
        x: 0.0,
        y: 0.0,
        width: 100.0,
        height: 100.0,
    };
    const INSIDE: PointerPoint = PointerPoint { x: 10.0, y: 10.0 };

    /// Replays one scripted response per call and records request bodies.
    struct ScriptedTransport {
        chunks: Vec<Vec<u8>>,
        hang: bool,
        requests: Mutex<Vec<StreamRequest>>,
    }

    impl ScriptedTransport {
        fn replying(lines: &[&str]) -> Arc<Self> {
            let chunks = lines
                .iter()
                .map(|l| format!("data: {l}\n").into_bytes())
                .collect();
            Arc::new(Self {
                chunks,
                hang: false,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn hanging(lines: &[&str]) -> Arc<Self> {
            let chunks = lines
                .iter()
                .map(|l| format!("data: {l}\n").into_bytes())
                .collect();
            Arc::new(Self {
                chunks,
                hang: true,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn open_stream(
            &self,
            request: StreamRequest,
        ) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
            self.requests.lock().unwrap().push(request);
            let chunks: Vec<Result<Vec<u8>, TransportError>> =
                self.chunks.iter().cloned().map(Ok).collect();
            let hang = self.hang;
            async move {
                let replay = futures_util::stream::iter(chunks);
                let stream: ByteStream = if hang {
                    replay.chain(futures_util::stream::pending()).boxed()
                } else {
                    replay.boxed()
                };
                Ok(stream)
            }
            .boxed()
        }
    }

    struct FakeInput {
        closes: Arc<AtomicUsize>,
    }

    impl AudioInput for FakeInput {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) -> BoxFuture<'_, Result<Vec<f32>>> {
            async {
                tokio::time::sleep(Duration::from_millis(15)).await;
                Ok(vec![0.1f32; 16_000])
            }
            .boxed()
        }

        fn level(&self) -> f32 {
            0.1
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        closes: Arc<AtomicUsize>,
    }

    impl AudioInputFactory for FakeFactory {
        fn open(&self, _device_name: Option<&str>) -> Result<Box<dyn AudioInput>, CoreError> {
            Ok(Box::new(FakeInput {
                closes: self.closes.clone(),
            }))
        }
    }

    struct FakeUploader {
        calls: AtomicUsize,
    }

    impl AttachmentUploader for FakeUploader {
        fn upload(
            &self,
            _payload: UploadPayload,
        ) -> BoxFuture<'static, Result<upload_client::UploadResult, UploadError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async {
                Ok(upload_client::UploadResult {
                    url: "https://cdn.parlo.app/clip.wav".to_string(),
                })
            }
            .boxed()
        }
    }

    fn core_with(
        transport: Arc<dyn ChatTransport>,
    ) -> (ChatCore, UnboundedReceiver<CoreEvent>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let (core, rx) = ChatCore::with_parts(
            CoreSettings::default(),
            transport,
            Arc::new(FakeUploader {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(FakeFactory {
                closes: closes.clone(),
            }),
        );
        (core, rx, closes)
    }

    async fn settle(core: &ChatCore, session_id: &str) {
        while core.is_generating(session_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn voice_capture_feeds_the_send_path_end_to_end() {
        let transport = ScriptedTransport::replying(&[
            r#"{"type":"token","text":"Sure"}"#,
            r#"{"type":"token","text":"!"}"#,
            r#"{"type":"done"}"#,
        ]);
        let (core, mut rx, closes) = core_with(transport.clone());

        assert!(core.press_record(BOUNDS));
        tokio::time::sleep(Duration::from_millis(900)).await;
        core.release_record(INSIDE).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // The host reacts to VoiceMessageReady by sending the clip.
        let mut ready = None;
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::VoiceMessageReady { url, duration_secs } = event {
                ready = Some((url, duration_secs));
            }
        }
        let (url, duration_secs) = ready.expect("voice clip committed");
        core.send_voice("s1", &url, duration_secs).unwrap();
        settle(&core, "s1").await;

        let messages = core.store().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert!(matches!(
            &messages[0].content,
            MessageContent::Voice { url, .. } if url == "https://cdn.parlo.app/clip.wav"
        ));
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, MessageContent::text("Sure!"));

        // Wire contract: voice sends carry audio fields, null content.
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content, None);
        assert_eq!(requests[0].audio_url.as_deref(), Some(url.as_str()));
        assert_eq!(requests[0].audio_duration, Some(duration_secs));
    }

    #[tokio::test(start_paused = true)]
    async fn recording_is_rejected_while_a_reply_is_streaming() {
        let transport = ScriptedTransport::hanging(&[r#"{"type":"token","text":"…"}"#]);
        let (core, _rx, _closes) = core_with(transport);

        core.send_text("s1", "hello").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(core.is_generating("s1"));

        assert!(!core.press_record(BOUNDS));
        assert_eq!(core.capture_status(), CaptureStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_halts_generation_and_recording() {
        let transport = ScriptedTransport::hanging(&[r#"{"type":"token","text":"Hel"}"#]);
        let (core, _rx, closes) = core_with(transport);

        core.send_text("s1", "hello").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        core.stop_all().await;

        assert!(!core.is_generating("s1"));
        let messages = core.store().messages();
        let assistant = messages.last().unwrap();
        assert_eq!(
            assistant.content,
            MessageContent::text(format!("Hel\n\n{STOPPED_MARKER}"))
        );
        assert!(!assistant.generating);
        assert_eq!(core.capture_status(), CaptureStatus::Idle);
        assert_eq!(closes.load(Ordering::SeqCst), 0, "no capture was active");

        // Conversation is immediately available again.
        core.send_text("s1", "again").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_with_nothing_active_is_a_noop() {
        let transport = ScriptedTransport::replying(&[]);
        let (core, _rx, _closes) = core_with(transport);
        core.stop_all().await;
        assert!(core.store().is_empty());
        assert_eq!(core.capture_status(), CaptureStatus::Idle);
    }
}
