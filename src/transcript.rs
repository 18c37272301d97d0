use crate::events::{CoreEvent, EventSender};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Opaque message identity. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MessageId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Image { url: String },
    Voice { url: String, duration_secs: f32 },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    /// True while an assistant placeholder is still being streamed into.
    pub generating: bool,
}

/// In-memory conversation state: the attachment point for streamed output.
///
/// Only two fields of a message ever mutate after creation (`content` text
/// and `generating`), and only through the methods below. History
/// persistence lives outside the core; this store is what the UI renders.
pub struct ConversationStore {
    messages: Mutex<Vec<Message>>,
    next_id: AtomicU64,
    events: EventSender,
}

impl ConversationStore {
    pub fn new(events: EventSender) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    fn allocate_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Append a finished message (user text/image/voice).
    pub fn push(&self, role: Role, content: MessageContent) -> MessageId {
        self.insert(role, content, false)
    }

    /// Append an empty assistant placeholder marked as generating, so the
    /// UI has something to attach streamed text to before the first token.
    pub fn push_placeholder(&self) -> MessageId {
        self.insert(Role::Assistant, MessageContent::text(""), true)
    }

    fn insert(&self, role: Role, content: MessageContent, generating: bool) -> MessageId {
        let message = Message {
            id: self.allocate_id(),
            role,
            content,
            created_at: Utc::now(),
            generating,
        };
        let id = message.id;
        self.messages.lock().unwrap().push(message.clone());
        self.events.emit(CoreEvent::MessageAdded { message });
        id
    }

    /// Replace the displayed text of a message. Returns false when the
    /// message no longer exists (stale-write guard for debounced flushes).
    pub fn update_text(&self, id: MessageId, text: &str) -> bool {
        let mut messages = self.messages.lock().unwrap();
        let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
            debug!("update for missing message {id:?}; skipping");
            return false;
        };
        message.content = MessageContent::text(text);
        drop(messages);
        self.events.emit(CoreEvent::MessageUpdated {
            id,
            text: text.to_string(),
        });
        true
    }

    /// Final write of a generation: set the terminal text and clear the
    /// generating flag. Returns false when the message no longer exists.
    pub fn finish_generation(&self, id: MessageId, text: &str) -> bool {
        let mut messages = self.messages.lock().unwrap();
        let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
            debug!("finalize for missing message {id:?}; skipping");
            return false;
        };
        message.content = MessageContent::text(text);
        message.generating = false;
        drop(messages);
        self.events.emit(CoreEvent::MessageUpdated {
            id,
            text: text.to_string(),
        });
        true
    }

    /// Remove a message outright (placeholder rollback on transport failure).
    pub fn remove(&self, id: MessageId) -> bool {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| m.id != id);
        let removed = messages.len() != before;
        drop(messages);
        if removed {
            self.events.emit(CoreEvent::MessageRemoved { id });
        }
        removed
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.lock().unwrap().iter().any(|m| m.id == id)
    }

    /// Snapshot of the conversation, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wipe the conversation (history-clear collaborator).
    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}
