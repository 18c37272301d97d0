//! Incremental parser for the line-framed generation stream.
//!
//! The server pushes newline-delimited frames; relevant lines carry a
//! `data:` marker followed by a JSON object with a `type` discriminator.
//! Chunk boundaries are arbitrary: a frame, or a multi-byte UTF-8
//! sequence inside one, may be split across reads, so incomplete trailing
//! bytes are carried over to the next feed.

use log::{debug, warn};
use serde::Deserialize;

/// Line prefix marking a frame that belongs to the event protocol.
pub const FRAME_MARKER: &str = "data:";

/// One decoded stream frame.
///
/// The discriminator is an open set on the wire; unrecognized kinds map to
/// [`StreamEvent::Other`] so new informational frames degrade gracefully
/// instead of failing the parse.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental token: `text` is the fragment to append.
    Token { text: String },
    /// Intermediate search signal. Display only, never required for
    /// correctness.
    Search {
        #[serde(default)]
        query: String,
    },
    /// Terminal frame: the generation is complete.
    Done,
    /// Recognized framing, unknown discriminator. Ignored.
    #[serde(other)]
    Other,
}

/// Splits an arbitrarily-chunked byte stream into [`StreamEvent`]s.
pub struct FrameParser {
    carry: Vec<u8>,
    saw_done: bool,
    dropped: u64,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            carry: Vec::new(),
            saw_done: false,
            dropped: 0,
        }
    }

    /// Feed one chunk of bytes; returns every event completed by it.
    ///
    /// The last (possibly incomplete) line is held back until the next
    /// feed or [`finish`](Self::finish).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.carry.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.carry.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=newline).collect();
            if let Some(event) = self.parse_line(&line[..line.len() - 1]) {
                events.push(event);
            }
        }
        events
    }

    /// Signal end of stream: drains the held-back line and, when no
    /// explicit terminal frame was seen, synthesizes one. A server that
    /// closes the connection without the marker therefore still terminates
    /// the session exactly once.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.carry.is_empty() {
            let line = std::mem::take(&mut self.carry);
            if let Some(event) = self.parse_line(&line) {
                events.push(event);
            }
        }
        if !self.saw_done {
            self.saw_done = true;
            events.push(StreamEvent::Done);
        }
        events
    }

    /// Count of malformed frames skipped so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    fn parse_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim_end_matches('\r').trim(),
            Err(e) => {
                warn!("skipping non-UTF-8 stream line: {e}");
                self.dropped += 1;
                return None;
            }
        };
        if line.is_empty() {
            return None;
        }

        let Some(payload) = line.strip_prefix(FRAME_MARKER) else {
            debug!("ignoring unframed stream line");
            return None;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return None;
        }

        match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => {
                if event == StreamEvent::Done {
                    self.saw_done = true;
                }
                Some(event)
            }
            Err(e) => {
                warn!("skipping malformed stream frame: {e}");
                self.dropped += 1;
                None
            }
        }
    }
}
