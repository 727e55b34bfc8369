//! Per-frame processing stages.
//!
//! A `FrameHandler` consumes one frame and optionally produces one. Returning
//! `None` drops the frame (frame-rate decimation does this).

mod motion;
mod rescale;

pub use motion::{MotionMask, DEFAULT_HISTORY, DEFAULT_KERNEL_SIZE, DEFAULT_THRESHOLD};
pub use rescale::Rescaler;

use crate::frame::Frame;

/// A stage in a frame pipeline.
///
/// Implementations must not retain the frame beyond the call except as their
/// own derived state (a background model, an accumulator).
pub trait FrameHandler {
    /// Handler identifier for logs.
    fn name(&self) -> &'static str;

    fn handle(&mut self, frame: Frame) -> Option<Frame>;
}
