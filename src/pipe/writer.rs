//! Encode raw frames through a transcoder's stdin.

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::Arc;

use super::command::{EncodeSettings, StreamEndpoint, Transcoder};
use crate::error::{MediaError, Result};
use crate::frame::{Frame, PixelFormat};

/// Writes frames to an encoder process.
///
/// The first frame fixes the output geometry and starts the encoder. Later frames
/// of a different size are resized to match, and single-channel masks are
/// replicated to BGR, so the encoder always sees one uniform raw stream.
pub struct FramePipeWriter {
    destination: String,
    settings: EncodeSettings,
    transcoder: Arc<dyn Transcoder>,
    canonical: Option<(u32, u32)>,
    encoder: Option<Encoder>,
    frames_written: u64,
    closed: bool,
}

struct Encoder {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl FramePipeWriter {
    pub fn new(
        destination: impl Into<String>,
        settings: EncodeSettings,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            destination: destination.into(),
            settings,
            transcoder,
            canonical: None,
            encoder: None,
            frames_written: 0,
            closed: false,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// (width, height) fixed by the first frame.
    pub fn canonical_dimensions(&self) -> Option<(u32, u32)> {
        self.canonical
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Append one frame to the output.
    ///
    /// Fails with `PipeClosed` once the encoder has exited or stopped reading,
    /// and after `close()`.
    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(closed(&self.destination, io::ErrorKind::NotConnected));
        }
        let (width, height) = *self
            .canonical
            .get_or_insert((frame.width(), frame.height()));
        let mut bgr = match frame.format() {
            PixelFormat::Bgr24 => None,
            _ => Some(frame.to_bgr()),
        };
        if frame.width() != width || frame.height() != height {
            let resized = bgr.as_ref().unwrap_or(frame).resized(width, height)?;
            bgr = Some(resized);
        }
        let payload = bgr.as_ref().unwrap_or(frame).as_bytes();

        if self.encoder.is_none() {
            self.encoder = Some(self.spawn(width, height)?);
        }
        let destination = &self.destination;
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(closed(destination, io::ErrorKind::NotConnected));
        };

        if let Ok(Some(status)) = encoder.child.try_wait() {
            encoder.stdin = None;
            log::warn!("encoder for {} already exited with {}", destination, status);
            return Err(closed(destination, io::ErrorKind::BrokenPipe));
        }
        let Some(stdin) = encoder.stdin.as_mut() else {
            return Err(closed(destination, io::ErrorKind::NotConnected));
        };
        if let Err(cause) = stdin.write_all(payload) {
            encoder.stdin = None;
            return Err(MediaError::PipeClosed {
                destination: destination.clone(),
                cause,
            });
        }
        self.frames_written += 1;
        Ok(())
    }

    /// Flush, close the encoder's input and wait for it to finish.
    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        let Some(mut encoder) = self.encoder.take() else {
            return Ok(());
        };
        if let Some(mut stdin) = encoder.stdin.take() {
            if let Err(e) = stdin.flush() {
                log::debug!("flush to {} failed: {}", self.destination, e);
            }
        }
        let status = encoder.child.wait()?;
        log::debug!(
            "encoder for {} finished after {} frames ({})",
            self.destination,
            self.frames_written,
            status
        );
        if !status.success() {
            return Err(MediaError::ProcessFailed {
                program: format!("encoder for {}", self.destination),
                status,
            });
        }
        Ok(())
    }

    fn spawn(&self, width: u32, height: u32) -> Result<Encoder> {
        let endpoint = StreamEndpoint::new(width, height, PixelFormat::Bgr24).with_fps(self.settings.fps);
        let mut command = self
            .transcoder
            .encode_command(&self.destination, &endpoint, &self.settings);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        let mut child = command.spawn().map_err(|cause| MediaError::Spawn {
            program: format!("encoder for {}", self.destination),
            cause,
        })?;
        log::debug!(
            "encoding {}x{} @ {} fps to {} (pid {})",
            width,
            height,
            self.settings.fps,
            self.destination,
            child.id()
        );
        let stdin = child.stdin.take();
        Ok(Encoder { child, stdin })
    }
}

fn closed(destination: &str, kind: io::ErrorKind) -> MediaError {
    MediaError::PipeClosed {
        destination: destination.to_string(),
        cause: io::Error::from(kind),
    }
}

impl Drop for FramePipeWriter {
    fn drop(&mut self) {
        if self.encoder.is_none() {
            return;
        }
        if let Err(e) = self.close() {
            log::warn!("closing encoder for {} failed: {}", self.destination, e);
        }
    }
}
