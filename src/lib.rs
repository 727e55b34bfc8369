//! Trail-camera video tooling.
//!
//! This crate moves raw video frames between external transcoders, live capture
//! sources and per-frame handlers, and supervises the long-running helper
//! processes (RTSP relay, loop broadcaster) a local test stream needs.
//!
//! # Module Structure
//!
//! - `process`: supervised external processes, relay and broadcast launchers
//! - `ingest`: live capture and the freshest-frame grabber
//! - `pipe`: raw frame pipes through ffmpeg (reader, writer, probe)
//! - `handler`: per-frame stages (rescale, motion mask)
//! - `frame`, `stats`: frame buffers and source metadata
//! - `config`, `ui`, `timing`, `perftest`: CLI support

pub mod config;
pub mod error;
pub mod frame;
pub mod handler;
pub mod ingest;
pub mod perftest;
pub mod pipe;
pub mod process;
pub mod stats;
pub mod timing;
pub mod ui;

pub use config::TrailcamConfig;
pub use error::{MediaError, Result};
pub use frame::{Frame, PixelFormat};
pub use handler::{FrameHandler, MotionMask, Rescaler};
pub use ingest::{Capture, FreshFrameGrabber, GrabberConfig, GrabberState, SyntheticCapture};
pub use pipe::{
    probe_video, EncodeSettings, Ffmpeg, FramePipeReader, FramePipeWriter, StreamEndpoint,
    Transcoder, VideoCodec,
};
pub use process::{ProcessSpec, ProcessStatus, ProcessSupervisor};
pub use stats::{Colourspace, VideoStats};
pub use timing::Timer;
