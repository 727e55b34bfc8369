//! Live frame ingestion.
//!
//! This module provides capture of live sources:
//! - `capture`: grab/retrieve handles (decoder pipe, synthetic `stub://` source)
//! - `grabber`: the background-threaded freshest-frame grabber
//!
//! Files and other finite sources are read with `pipe::FramePipeReader` instead;
//! the grabber exists for feeds where falling behind is worse than dropping frames.

pub mod capture;
pub mod grabber;

pub use capture::{Capture, PipeCapture, SyntheticCapture};
pub use grabber::{CancelHandle, FreshFrameGrabber, FreshFrames, GrabberConfig, GrabberState};
