//! Press-and-hold voice capture: gesture policy and the recording state
//! machine that turns a press into a bounded, uploaded audio clip.

pub mod gesture;
pub mod machine;

pub use gesture::{ControlBounds, PointerPoint};
pub use machine::{AudioInput, AudioInputFactory, CaptureManager, CaptureStatus};
