//! Debounced bridge between the token stream and the conversation store.
//!
//! Token events can arrive far faster than the UI should repaint. Each
//! fragment lands in an accumulator and re-arms a short debounce task;
//! only when the task fires is the message text rewritten. Termination
//! performs one synchronous final write so the displayed text always ends
//! up exactly equal to the full accumulation, no matter how the debounce
//! timing fell.

use crate::transcript::{ConversationStore, MessageId};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Appended to the partial text when a generation is stopped by the user.
pub const STOPPED_MARKER: &str = "(stopped)";

struct Inner {
    message_id: MessageId,
    store: Arc<ConversationStore>,
    debounce: Duration,
    accumulated: Mutex<String>,
    pending_flush: Mutex<Option<JoinHandle<()>>>,
    finalized: AtomicBool,
}

/// Accumulates streamed fragments for one placeholder message.
///
/// Clones share state: the read loop pushes fragments while the owner of
/// another clone may finalize or abandon at any time. Finalization is
/// exactly-once across all clones.
#[derive(Clone)]
pub struct RenderBuffer {
    inner: Arc<Inner>,
}

impl RenderBuffer {
    pub fn new(message_id: MessageId, store: Arc<ConversationStore>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                message_id,
                store,
                debounce,
                accumulated: Mutex::new(String::new()),
                pending_flush: Mutex::new(None),
                finalized: AtomicBool::new(false),
            }),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.inner.message_id
    }

    /// Append one fragment and (re)arm the debounce flush.
    pub fn push(&self, fragment: &str) {
        if self.inner.finalized.load(Ordering::SeqCst) {
            return;
        }
        self.inner.accumulated.lock().unwrap().push_str(fragment);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            if inner.finalized.load(Ordering::SeqCst) {
                return;
            }
            let snapshot = inner.accumulated.lock().unwrap().clone();
            if !inner.store.update_text(inner.message_id, &snapshot) {
                debug!("debounce flush target gone; skipped");
            }
        });

        if let Some(previous) = self.inner.pending_flush.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    /// Terminal write: cancel any pending flush and synchronously set the
    /// final text. With `stopped`, the stopped marker is appended after the
    /// partial accumulation. Returns the final text the first time it is
    /// called; `None` on any later call or after [`abandon`](Self::abandon).
    pub fn finalize(&self, stopped: bool) -> Option<String> {
        if self.inner.finalized.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.cancel_pending();

        let mut text = self.inner.accumulated.lock().unwrap().clone();
        if stopped {
            if text.is_empty() {
                text.push_str(STOPPED_MARKER);
            } else {
                text.push_str("\n\n");
                text.push_str(STOPPED_MARKER);
            }
        }
        if !self.inner.store.finish_generation(self.inner.message_id, &text) {
            debug!("finalize target gone; skipped");
        }
        Some(text)
    }

    /// Drop all buffered output without writing (placeholder rollback).
    pub fn abandon(&self) {
        self.inner.finalized.store(true, Ordering::SeqCst);
        self.cancel_pending();
    }

    fn cancel_pending(&self) {
        if let Some(task) = self.inner.pending_flush.lock().unwrap().take() {
            task.abort();
        }
    }
}
