//! Per-conversation generation sessions.
//!
//! One request opens one streamed generation. The manager guarantees
//! single-flight per conversation, creates the assistant placeholder
//! before any network byte is read, pumps parsed frames into the render
//! buffer, and tears everything down on completion, failure, or
//! cancellation.

use crate::error::{CoreError, TransportError};
use crate::events::{CoreEvent, EventSender, Notice};
use crate::streaming::parser::{FrameParser, StreamEvent};
use crate::streaming::render::RenderBuffer;
use crate::transcript::{ConversationStore, MessageContent, MessageId, Role};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Body of `POST /chat/stream`. `content` is null for voice sends; the
/// attachment fields are null otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest {
    pub session_id: String,
    pub content: Option<String>,
    pub img_url: Option<String>,
    pub audio_url: Option<String>,
    pub audio_duration: Option<f32>,
}

/// What the user is sending into the conversation.
#[derive(Debug, Clone)]
pub enum OutgoingContent {
    Text(String),
    Image { url: String },
    Voice { url: String, duration_secs: f32 },
}

impl OutgoingContent {
    fn message_content(&self) -> MessageContent {
        match self {
            OutgoingContent::Text(text) => MessageContent::text(text.clone()),
            OutgoingContent::Image { url } => MessageContent::Image { url: url.clone() },
            OutgoingContent::Voice { url, duration_secs } => MessageContent::Voice {
                url: url.clone(),
                duration_secs: *duration_secs,
            },
        }
    }

    fn into_request(self, session_id: &str) -> StreamRequest {
        let mut request = StreamRequest {
            session_id: session_id.to_string(),
            content: None,
            img_url: None,
            audio_url: None,
            audio_duration: None,
        };
        match self {
            OutgoingContent::Text(text) => request.content = Some(text),
            OutgoingContent::Image { url } => request.img_url = Some(url),
            OutgoingContent::Voice { url, duration_secs } => {
                request.audio_url = Some(url);
                request.audio_duration = Some(duration_secs);
            }
        }
        request
    }
}

/// Raw bytes of the generation stream body, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Seam between the session manager and the wire. The HTTP implementation
/// lives in `stream_client`; tests substitute scripted streams.
pub trait ChatTransport: Send + Sync + 'static {
    fn open_stream(&self, request: StreamRequest)
        -> BoxFuture<'static, Result<ByteStream, TransportError>>;
}

struct ActiveGeneration {
    message_id: MessageId,
    render: RenderBuffer,
    task: Option<JoinHandle<()>>,
}

/// Owns all live generation sessions, keyed by conversation session id.
#[derive(Clone)]
pub struct GenerationManager {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    events: EventSender,
    debounce: Duration,
    active: Arc<Mutex<HashMap<String, ActiveGeneration>>>,
}

impl GenerationManager {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        events: EventSender,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            debounce,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open one streamed generation for `session_id`.
    ///
    /// While a session is live for that conversation the call is rejected
    /// with [`CoreError::Busy`] and has no observable side effects beyond a
    /// soft notice. On acceptance the user message and the assistant
    /// placeholder are appended synchronously, before any network I/O.
    pub fn request(
        &self,
        session_id: &str,
        outgoing: OutgoingContent,
    ) -> Result<MessageId, CoreError> {
        let render = {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(session_id) {
                debug!("generation already active for {session_id}; rejecting");
                self.events.notice(Notice::Busy);
                return Err(CoreError::Busy);
            }

            self.store.push(Role::User, outgoing.message_content());
            let message_id = self.store.push_placeholder();
            let render = RenderBuffer::new(message_id, self.store.clone(), self.debounce);
            active.insert(
                session_id.to_string(),
                ActiveGeneration {
                    message_id,
                    render: render.clone(),
                    task: None,
                },
            );
            render
        };

        let message_id = render.message_id();
        self.events.emit(CoreEvent::GenerationStarted { id: message_id });
        info!("generation started for {session_id} (message {message_id:?})");

        let request = outgoing.into_request(session_id);
        let manager = self.clone();
        let key = session_id.to_string();
        let task = tokio::spawn(async move {
            manager.run_stream(&key, render, request).await;
        });

        // The task clears its own slot on completion; if it already has,
        // the handle just detaches here.
        if let Some(slot) = self.active.lock().unwrap().get_mut(session_id) {
            slot.task = Some(task);
        }

        Ok(message_id)
    }

    async fn run_stream(&self, session_id: &str, render: RenderBuffer, request: StreamRequest) {
        let mut stream = match self.transport.open_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.rollback(session_id, &render, e);
                return;
            }
        };

        let mut parser = FrameParser::new();
        let mut terminal = false;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if self.apply_events(&render, parser.feed(&bytes)) {
                        terminal = true;
                        break;
                    }
                }
                Err(e) => {
                    self.rollback(session_id, &render, e);
                    return;
                }
            }
        }
        if !terminal {
            // Stream closed without an explicit terminal frame.
            self.apply_events(&render, parser.finish());
        }
        if parser.dropped_frames() > 0 {
            warn!(
                "{} malformed frame(s) skipped for {session_id}",
                parser.dropped_frames()
            );
        }

        if render.finalize(false).is_some() {
            self.events.emit(CoreEvent::GenerationEnded {
                id: render.message_id(),
            });
        }
        self.active.lock().unwrap().remove(session_id);
        info!("generation completed for {session_id}");
    }

    /// Returns true when a terminal frame was applied.
    fn apply_events(&self, render: &RenderBuffer, events: Vec<StreamEvent>) -> bool {
        for event in events {
            match event {
                StreamEvent::Token { text } => render.push(&text),
                StreamEvent::Search { query } => {
                    self.events.emit(CoreEvent::SearchNotice { query })
                }
                StreamEvent::Done => return true,
                StreamEvent::Other => {}
            }
        }
        false
    }

    fn rollback(&self, session_id: &str, render: &RenderBuffer, error: TransportError) {
        warn!("generation stream failed for {session_id}: {error}");
        render.abandon();
        self.store.remove(render.message_id());
        self.active.lock().unwrap().remove(session_id);
        self.events.emit(CoreEvent::GenerationFailed {
            message: error.to_string(),
        });
    }

    /// Stop the live generation for `session_id`, keeping the partial text.
    ///
    /// The read-loop task is aborted outright, which drops the response
    /// body and releases the underlying connection; the placeholder is
    /// finalized with the accumulated text plus the stopped marker.
    pub fn cancel(&self, session_id: &str) -> bool {
        let Some(slot) = self.active.lock().unwrap().remove(session_id) else {
            return false;
        };
        if let Some(task) = slot.task {
            task.abort();
        }
        if slot.render.finalize(true).is_some() {
            self.events.emit(CoreEvent::GenerationEnded { id: slot.message_id });
        }
        info!("generation cancelled for {session_id}");
        true
    }

    /// Stop every live generation (global stop action).
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.active.lock().unwrap().keys().cloned().collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(session_id)
    }

    pub fn is_any_active(&self) -> bool {
        !self.active.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CoreEvent;
    use crate::streaming::render::STOPPED_MARKER;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn frame(json: &str) -> Vec<u8> {
        format!("data: {json}\n").into_bytes()
    }

    fn token_frame(text: &str) -> Vec<u8> {
        frame(&format!(r#"{{"type":"token","text":"{text}"}}"#))
    }

    /// Transport that replays a fixed chunk script, optionally hanging
    /// afterwards instead of closing.
    struct ScriptedTransport {
        chunks: Vec<Result<Vec<u8>, String>>,
        hang_at_end: bool,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(chunks: Vec<Result<Vec<u8>, String>>) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                hang_at_end: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn hanging(chunks: Vec<Result<Vec<u8>, String>>) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                hang_at_end: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn open_stream(
            &self,
            _request: StreamRequest,
        ) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let chunks: Vec<Result<Vec<u8>, TransportError>> = self
                .chunks
                .iter()
                .map(|c| c.clone().map_err(TransportError::Read))
                .collect();
            let hang = self.hang_at_end;
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

    /// Transport whose open fails with a non-success status.
    struct RejectingTransport;

    impl ChatTransport for RejectingTransport {
        fn open_stream(
            &self,
            _request: StreamRequest,
        ) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
            async {
                Err(TransportError::Status {
                    code: 500,
                    message: "internal".to_string(),
                })
            }
            .boxed()
        }
    }

    struct Harness {
        manager: GenerationManager,
        store: Arc<ConversationStore>,
        rx: UnboundedReceiver<CoreEvent>,
    }

    fn harness(transport: Arc<dyn ChatTransport>) -> Harness {
        let (events, rx) = EventSender::channel();
        let store = Arc::new(ConversationStore::new(events.clone()));
        let manager =
            GenerationManager::new(store.clone(), transport, events, Duration::from_millis(50));
        Harness { manager, store, rx }
    }

    async fn wait_until_idle(manager: &GenerationManager, session_id: &str) {
        while manager.is_active(session_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn assistant_texts(store: &ConversationStore) -> Vec<(String, bool)> {
        store
            .messages()
            .into_iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| match m.content {
                MessageContent::Text { text } => (text, m.generating),
                other => panic!("unexpected assistant content {other:?}"),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_accumulate_and_terminal_frame_finalizes() {
        let transport = ScriptedTransport::new(vec![
            Ok(token_frame("Hel")),
            Ok(token_frame("lo")),
            Ok(frame(r#"{"type":"done"}"#)),
        ]);
        let h = harness(transport);

        h.manager
            .request("s1", OutgoingContent::Text("hi".to_string()))
            .unwrap();
        // Placeholder exists before any byte was consumed.
        assert_eq!(h.store.len(), 2);
        assert_eq!(assistant_texts(&h.store), vec![(String::new(), true)]);

        wait_until_idle(&h.manager, "s1").await;
        assert_eq!(assistant_texts(&h.store), vec![("Hello".to_string(), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_close_without_done_still_finalizes() {
        let transport = ScriptedTransport::new(vec![Ok(token_frame("partial"))]);
        let h = harness(transport);

        h.manager
            .request("s1", OutgoingContent::Text("hi".to_string()))
            .unwrap();
        wait_until_idle(&h.manager, "s1").await;
        assert_eq!(
            assistant_texts(&h.store),
            vec![("partial".to_string(), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_is_rejected_without_side_effects() {
        let transport =
            ScriptedTransport::hanging(vec![Ok(token_frame("a"))]);
        let h = harness(transport.clone());

        h.manager
            .request("s1", OutgoingContent::Text("one".to_string()))
            .unwrap();
        // Let the read loop open its stream and park on the hanging tail.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let before = h.store.len();

        let err = h
            .manager
            .request("s1", OutgoingContent::Text("two".to_string()))
            .unwrap_err();
        assert!(matches!(err, CoreError::Busy));
        assert_eq!(h.store.len(), before, "no second user message/placeholder");
        assert_eq!(transport.calls(), 1, "no second network call");

        // A different conversation is unaffected by s1's flight.
        assert!(!h.manager.is_active("s2"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_rejection_rolls_back_placeholder() {
        let h = harness(Arc::new(RejectingTransport));

        h.manager
            .request("s1", OutgoingContent::Text("hi".to_string()))
            .unwrap();
        wait_until_idle(&h.manager, "s1").await;

        assert!(assistant_texts(&h.store).is_empty(), "placeholder removed");
        assert_eq!(h.store.len(), 1, "user message preserved");
    }

    #[tokio::test(start_paused = true)]
    async fn mid_read_error_rolls_back_placeholder() {
        let transport = ScriptedTransport::new(vec![
            Ok(token_frame("oops")),
            Err("connection reset".to_string()),
        ]);
        let h = harness(transport);

        h.manager
            .request("s1", OutgoingContent::Text("hi".to_string()))
            .unwrap();
        wait_until_idle(&h.manager, "s1").await;

        assert!(assistant_texts(&h.store).is_empty());
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_preserves_partial_text_with_marker() {
        let transport = ScriptedTransport::hanging(vec![
            Ok(token_frame("Hel")),
            Ok(token_frame("lo")),
        ]);
        let h = harness(transport);

        h.manager
            .request("s1", OutgoingContent::Text("hi".to_string()))
            .unwrap();
        // Let the read loop drain the scripted chunks, then hang.
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.manager.cancel("s1"));
        assert_eq!(
            assistant_texts(&h.store),
            vec![(format!("Hello\n\n{STOPPED_MARKER}"), false)]
        );

        // The conversation is free for a new request.
        assert!(!h.manager.is_active("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_active_session_is_a_noop() {
        let h = harness(ScriptedTransport::new(vec![]));
        assert!(!h.manager.cancel("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn search_frames_surface_as_notices() {
        let transport = ScriptedTransport::new(vec![
            Ok(frame(r#"{"type":"search","query":"rust"}"#)),
            Ok(frame(r#"{"type":"done"}"#)),
        ]);
        let mut h = harness(transport);

        h.manager
            .request("s1", OutgoingContent::Text("hi".to_string()))
            .unwrap();
        wait_until_idle(&h.manager, "s1").await;

        let mut saw_search = false;
        while let Ok(event) = h.rx.try_recv() {
            if let CoreEvent::SearchNotice { query } = event {
                assert_eq!(query, "rust");
                saw_search = true;
            }
        }
        assert!(saw_search);
    }

    #[tokio::test(start_paused = true)]
    async fn voice_request_body_carries_audio_fields() {
        let outgoing = OutgoingContent::Voice {
            url: "https://cdn/clip.wav".to_string(),
            duration_secs: 2.5,
        };
        let request = outgoing.into_request("s9");
        assert_eq!(request.session_id, "s9");
        assert_eq!(request.content, None);
        assert_eq!(request.audio_url.as_deref(), Some("https://cdn/clip.wav"));
        assert_eq!(request.audio_duration, Some(2.5));
        assert_eq!(request.img_url, None);
    }
}
