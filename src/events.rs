use crate::transcript::{Message, MessageId};
use log::trace;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Events emitted by the core for the embedding UI to consume.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum CoreEvent {
    /// A message was appended to the conversation.
    MessageAdded { message: Message },
    /// The displayed text of a message changed (streaming updates land here).
    MessageUpdated { id: MessageId, text: String },
    /// A message was removed (error rollback).
    MessageRemoved { id: MessageId },
    /// A generation accepted a request and created its placeholder.
    GenerationStarted { id: MessageId },
    /// A generation reached a terminal state (completed or stopped).
    GenerationEnded { id: MessageId },
    /// The generation stream failed; the placeholder has been rolled back.
    GenerationFailed { message: String },
    /// Intermediate search/progress signal from the stream. Display only.
    SearchNotice { query: String },
    /// Voice capture started.
    CaptureStarted,
    /// Periodic capture progress: elapsed time and input level (RMS).
    CaptureTick { elapsed_ms: u64, level: f32 },
    /// Capture could not start (microphone access).
    CaptureFailed { message: String },
    /// A captured clip was uploaded; emitted exactly once per committed capture.
    VoiceMessageReady { url: String, duration_secs: f32 },
    /// Attachment upload failed; any optimistic preview should be rolled back.
    UploadFailed { message: String },
    /// Soft, non-error notice.
    Notice { notice: Notice },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    /// Start/request ignored because something is already in flight.
    Busy,
    /// Recording discarded because the gesture was released out of bounds.
    RecordingCancelled,
    /// Recording discarded because it was shorter than the minimum duration.
    RecordingTooShort,
}

/// Cheap-to-clone sender half of the core event channel.
///
/// Sends never block; if the UI side has gone away the event is dropped.
#[derive(Clone)]
pub struct EventSender(UnboundedSender<CoreEvent>);

impl EventSender {
    pub fn channel() -> (Self, UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn emit(&self, event: CoreEvent) {
        if self.0.send(event).is_err() {
            trace!("event receiver dropped; event discarded");
        }
    }

    pub fn notice(&self, notice: Notice) {
        self.emit(CoreEvent::Notice { notice });
    }
}
