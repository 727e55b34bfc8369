//! Raw frame pipes to and from an external transcoder.
//!
//! - `command`: the `Transcoder` seam and its ffmpeg implementation
//! - `reader`: decode a source into an iterator of frames read off the child's stdout
//! - `writer`: encode frames written to the child's stdin
//!
//! Frames cross the pipe as tightly packed rows with no header; both sides agree
//! on geometry and pixel format up front.

pub mod command;
pub mod reader;
pub mod writer;

use std::io::{self, Read};

pub use command::{probe_video, EncodeSettings, Ffmpeg, StreamEndpoint, Transcoder, VideoCodec};
pub use reader::FramePipeReader;
pub use writer::FramePipeWriter;

/// Fill `buf` completely from `reader`.
///
/// Returns `Ok(false)` when the stream ends first, including a partial trailing
/// frame; a truncated frame is never surfaced.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled > 0 {
                    log::debug!("discarding partial frame ({} of {} bytes)", filled, buf.len());
                }
                return Ok(false);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
