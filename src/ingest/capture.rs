//! Capture handles with split grab/retrieve.
//!
//! `grab()` pulls the next raw unit off the source without decoding it; `retrieve()`
//! turns the most recently grabbed unit into a `Frame`. Splitting the two lets a
//! background thread keep draining a live source while the consumer decodes only
//! what it actually looks at.

use std::process::{Child, ChildStdout, Stdio};
use std::thread;
use std::time::Duration;

use crate::error::{MediaError, Result};
use crate::frame::{Frame, PixelFormat};
use crate::pipe::{read_full, StreamEndpoint, Transcoder};
use crate::process::kill_and_reap;

/// A source that can be drained one raw unit at a time.
pub trait Capture: Send {
    /// Capture the next unit. `Ok(false)` means end of stream.
    fn grab(&mut self) -> Result<bool>;

    /// Decode the most recently grabbed unit.
    fn retrieve(&mut self) -> Result<Frame>;

    /// Release the underlying handle. Further grabs report end of stream.
    fn release(&mut self);
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

/// Generates a moving gradient; every grab is a new unit with the next sequence number.
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    grabbed: u64,
    limit: Option<u64>,
    grab_delay: Option<Duration>,
    released: bool,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            grabbed: 0,
            limit: None,
            grab_delay: None,
            released: false,
        }
    }

    /// End the stream after `units` grabs.
    pub fn with_limit(mut self, units: u64) -> Self {
        self.limit = Some(units);
        self
    }

    /// Simulate source pacing: each grab blocks for `delay`.
    pub fn with_grab_delay(mut self, delay: Duration) -> Self {
        self.grab_delay = Some(delay);
        self
    }

    pub fn grabbed(&self) -> u64 {
        self.grabbed
    }

    fn generate_pixels(&self, seq: u64) -> Vec<u8> {
        let len = PixelFormat::Bgr24.frame_len(self.width, self.height);
        // Scene shifts every 50 units so motion handlers have something to find.
        let scene = seq / 50;
        (0..len)
            .map(|i| ((i as u64 + seq + scene * 37) % 256) as u8)
            .collect()
    }
}

impl Capture for SyntheticCapture {
    fn grab(&mut self) -> Result<bool> {
        if self.released {
            return Ok(false);
        }
        if let Some(limit) = self.limit {
            if self.grabbed >= limit {
                return Ok(false);
            }
        }
        if let Some(delay) = self.grab_delay {
            thread::sleep(delay);
        }
        self.grabbed += 1;
        Ok(true)
    }

    fn retrieve(&mut self) -> Result<Frame> {
        if self.grabbed == 0 {
            return Err(MediaError::InvalidFrame("retrieve before first grab".to_string()));
        }
        let seq = self.grabbed - 1;
        Frame::new(
            self.generate_pixels(seq),
            self.width,
            self.height,
            PixelFormat::Bgr24,
            seq,
        )
    }

    fn release(&mut self) {
        self.released = true;
    }
}

// ----------------------------------------------------------------------------
// Decoder pipe source
// ----------------------------------------------------------------------------

/// Live capture through a transcoder's raw stdout.
///
/// A grab reads one whole frame into the internal buffer; retrieve copies it out.
pub struct PipeCapture {
    source: String,
    endpoint: StreamEndpoint,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    buf: Vec<u8>,
    grabbed: u64,
}

impl PipeCapture {
    /// Start decoding `source`. Probes for dimensions when none are given.
    ///
    /// Every failure, including the probe, is reported as `StreamOpen`.
    pub fn open(
        source: &str,
        transcoder: &dyn Transcoder,
        dimensions: Option<(u32, u32)>,
        format: PixelFormat,
    ) -> Result<Self> {
        let (width, height) = match dimensions {
            Some(dims) => dims,
            None => {
                let stats = transcoder
                    .probe(source)
                    .map_err(|e| MediaError::stream_open(source, e.to_string()))?;
                (stats.width, stats.height)
            }
        };
        let endpoint = StreamEndpoint::new(width, height, format);
        let mut command = transcoder.decode_command(source, &endpoint);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command
            .spawn()
            .map_err(|e| MediaError::stream_open(source, format!("cannot start decoder: {}", e)))?;
        let stdout = child.stdout.take();
        log::info!(
            "capture opened on {} ({}x{} {:?}, pid {})",
            source,
            width,
            height,
            format,
            child.id()
        );
        Ok(Self {
            source: source.to_string(),
            endpoint,
            child: Some(child),
            stdout,
            buf: vec![0u8; endpoint.frame_len()],
            grabbed: 0,
        })
    }

    pub fn endpoint(&self) -> StreamEndpoint {
        self.endpoint
    }
}

impl Capture for PipeCapture {
    fn grab(&mut self) -> Result<bool> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(false);
        };
        if !read_full(stdout, &mut self.buf)? {
            log::info!("capture on {} reached end of stream", self.source);
            self.stdout = None;
            return Ok(false);
        }
        self.grabbed += 1;
        Ok(true)
    }

    fn retrieve(&mut self) -> Result<Frame> {
        if self.grabbed == 0 {
            return Err(MediaError::InvalidFrame("retrieve before first grab".to_string()));
        }
        Frame::new(
            self.buf.clone(),
            self.endpoint.width,
            self.endpoint.height,
            self.endpoint.format,
            self.grabbed - 1,
        )
    }

    fn release(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            kill_and_reap(&mut child);
            log::debug!("capture on {} released", self.source);
        }
    }
}

impl Drop for PipeCapture {
    fn drop(&mut self) {
        self.release();
    }
}
