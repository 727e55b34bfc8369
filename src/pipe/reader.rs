//! Decode a video source into raw frames.

use std::process::{Child, ChildStdout, Stdio};
use std::sync::Arc;

use super::command::{StreamEndpoint, Transcoder};
use super::read_full;
use crate::error::{MediaError, Result};
use crate::frame::{Frame, PixelFormat};
use crate::process::kill_and_reap;

/// Reads fixed-size raw frames from a transcoder's stdout.
///
/// Dimensions come from the caller or, if omitted, from a probe of the source.
/// Iteration yields frames in source order with sequence numbers from zero and
/// ends at the first short read. Dropping the reader early kills the transcoder.
pub struct FramePipeReader {
    source: String,
    transcoder: Arc<dyn Transcoder>,
    dimensions: Option<(u32, u32)>,
    format: PixelFormat,
    fps: Option<f64>,
    running: Option<Running>,
    next_seq: u64,
    finished: bool,
}

struct Running {
    endpoint: StreamEndpoint,
    child: Child,
    stdout: Option<ChildStdout>,
    buf: Vec<u8>,
}

impl FramePipeReader {
    pub fn new(source: impl Into<String>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            source: source.into(),
            transcoder,
            dimensions: None,
            format: PixelFormat::Bgr24,
            fps: None,
            running: None,
            next_seq: 0,
            finished: false,
        }
    }

    /// Skip probing and have the transcoder scale to `width` x `height`.
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some((width, height));
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Resample the source to `fps` frames per second.
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Geometry of the open stream, `None` before `open`.
    pub fn endpoint(&self) -> Option<StreamEndpoint> {
        self.running.as_ref().map(|r| r.endpoint)
    }

    /// Start the transcoder. Called implicitly by the first `next()`.
    pub fn open(&mut self) -> Result<StreamEndpoint> {
        if let Some(running) = &self.running {
            return Ok(running.endpoint);
        }
        let (width, height) = match self.dimensions {
            Some(dims) => dims,
            None => {
                let stats = self.transcoder.probe(&self.source)?;
                (stats.width, stats.height)
            }
        };
        let mut endpoint = StreamEndpoint::new(width, height, self.format);
        endpoint.fps = self.fps;

        let mut command = self.transcoder.decode_command(&self.source, &endpoint);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command
            .spawn()
            .map_err(|e| MediaError::stream_open(&self.source, format!("cannot start decoder: {}", e)))?;
        let stdout = child.stdout.take();
        log::debug!(
            "decoding {} as {}x{} {:?} (pid {})",
            self.source,
            width,
            height,
            self.format,
            child.id()
        );
        self.running = Some(Running {
            endpoint,
            child,
            stdout,
            buf: vec![0u8; endpoint.frame_len()],
        });
        Ok(endpoint)
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.open()?;
        let Some(running) = self.running.as_mut() else {
            return Ok(None);
        };
        let Some(stdout) = running.stdout.as_mut() else {
            return Ok(None);
        };
        if !read_full(stdout, &mut running.buf)? {
            self.finish();
            return Ok(None);
        }
        let endpoint = running.endpoint;
        let frame = Frame::new(
            running.buf.clone(),
            endpoint.width,
            endpoint.height,
            endpoint.format,
            self.next_seq,
        )?;
        self.next_seq += 1;
        Ok(Some(frame))
    }

    /// End of stream: close our end and reap the transcoder.
    fn finish(&mut self) {
        self.finished = true;
        let Some(running) = self.running.as_mut() else {
            return;
        };
        running.stdout = None;
        match running.child.wait() {
            Ok(status) if !status.success() => {
                log::warn!("decoder for {} exited with {}", self.source, status)
            }
            Ok(_) => {}
            Err(e) => log::debug!("wait on decoder for {} failed: {}", self.source, e),
        }
    }
}

impl Iterator for FramePipeReader {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for FramePipeReader {
    fn drop(&mut self) {
        if let Some(running) = self.running.as_mut() {
            running.stdout = None;
            kill_and_reap(&mut running.child);
        }
    }
}
