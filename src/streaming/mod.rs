//! Streamed generation pipeline: wire-frame parsing, debounced rendering,
//! and the per-conversation session manager that composes them.

pub mod parser;
pub mod render;
pub mod session;

pub use parser::{FrameParser, StreamEvent};
pub use render::{RenderBuffer, STOPPED_MARKER};
pub use session::{ChatTransport, GenerationManager, OutgoingContent, StreamRequest};
