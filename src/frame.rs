//! Raw frame container.
//!
//! - `Frame`: immutable, owned pixel buffer with a sequence number. Bytes can be read, never mutated.
//! - `PixelFormat`: packed 8-bit layouts that travel over decoder/encoder pipes.
//!
//! A `Frame` is always exactly `width * height * channels` bytes. Every transformation
//! (`to_bgr`, `resized`) produces a new frame; the original is untouched.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use crate::error::{MediaError, Result};

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

/// Packed pixel layouts understood by the frame pipes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    /// Single channel, 8 bits (greyscale or motion mask).
    Gray8,
    /// Three channels, blue-green-red order.
    #[default]
    Bgr24,
    /// Four channels, blue-green-red-alpha order.
    Bgra32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Bgr24 => 3,
            PixelFormat::Bgra32 => 4,
        }
    }

    /// Name used on the ffmpeg command line (`-pix_fmt`).
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "gray",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Bgra32 => "bgra",
        }
    }

    /// Byte length of one frame in this format.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Immutable raw frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    seq: u64,
}

impl Frame {
    /// Wrap a pixel buffer. Fails if the buffer length does not match the shape.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, seq: u64) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidFrame(format!(
                "zero-sized frame {}x{}",
                width, height
            )));
        }
        let expected = format.frame_len(width, height);
        if data.len() != expected {
            return Err(MediaError::InvalidFrame(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            seq,
        })
    }

    /// Frame of a single repeated byte value. Handy for tests and placeholders.
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8, seq: u64) -> Self {
        Self {
            data: vec![value; format.frame_len(width, height)],
            width,
            height,
            format,
            seq,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    /// Sequence number assigned by the producer.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// (height, width, channels), the row-major shape of the buffer.
    pub fn shape(&self) -> (u32, u32, usize) {
        (self.height, self.width, self.channels())
    }

    /// Convert to three-channel BGR: masks are replicated across channels, alpha is dropped.
    pub fn to_bgr(&self) -> Frame {
        let data = match self.format {
            PixelFormat::Bgr24 => self.data.clone(),
            PixelFormat::Gray8 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
            PixelFormat::Bgra32 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        };
        Frame {
            data,
            width: self.width,
            height: self.height,
            format: PixelFormat::Bgr24,
            seq: self.seq,
        }
    }

    /// Bilinear resize to `width` x `height`. Four-channel frames are converted to BGR first.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidFrame(format!(
                "cannot resize to {}x{}",
                width, height
            )));
        }
        match self.format {
            PixelFormat::Gray8 => {
                let src = GrayImage::from_raw(self.width, self.height, self.data.clone())
                    .ok_or_else(|| MediaError::InvalidFrame("grey buffer shape".to_string()))?;
                let out = imageops::resize(&src, width, height, FilterType::Triangle);
                Frame::new(out.into_raw(), width, height, PixelFormat::Gray8, self.seq)
            }
            PixelFormat::Bgr24 | PixelFormat::Bgra32 => {
                let bgr = self.to_bgr();
                // channel order does not matter to the filter
                let src = RgbImage::from_raw(bgr.width, bgr.height, bgr.data)
                    .ok_or_else(|| MediaError::InvalidFrame("bgr buffer shape".to_string()))?;
                let out = imageops::resize(&src, width, height, FilterType::Triangle);
                Frame::new(out.into_raw(), width, height, PixelFormat::Bgr24, self.seq)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_length() {
        let err = Frame::new(vec![0u8; 10], 4, 4, PixelFormat::Bgr24, 0).unwrap_err();
        assert_eq!(err.code(), "invalid_frame");
        assert!(Frame::new(vec![0u8; 48], 4, 4, PixelFormat::Bgr24, 0).is_ok());
    }

    #[test]
    fn frame_rejects_zero_dimensions() {
        assert!(Frame::new(vec![], 0, 4, PixelFormat::Gray8, 0).is_err());
    }

    #[test]
    fn mask_expands_to_three_channels() {
        let mask = Frame::new(vec![0, 255, 7, 9], 2, 2, PixelFormat::Gray8, 3).unwrap();
        let bgr = mask.to_bgr();
        assert_eq!(bgr.format(), PixelFormat::Bgr24);
        assert_eq!(bgr.seq(), 3);
        assert_eq!(bgr.as_bytes(), &[0, 0, 0, 255, 255, 255, 7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn alpha_channel_is_dropped() {
        let bgra = Frame::new(vec![1, 2, 3, 200, 4, 5, 6, 100], 2, 1, PixelFormat::Bgra32, 0).unwrap();
        assert_eq!(bgra.to_bgr().as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn resize_produces_requested_shape() {
        let frame = Frame::filled(50, 50, PixelFormat::Bgr24, 90, 1);
        let resized = frame.resized(100, 100).unwrap();
        assert_eq!(resized.shape(), (100, 100, 3));
        assert_eq!(resized.as_bytes().len(), 100 * 100 * 3);
        assert!(resized.as_bytes().iter().all(|&v| v == 90));
    }

    #[test]
    fn resize_keeps_grey_layout() {
        let frame = Frame::filled(8, 6, PixelFormat::Gray8, 12, 0);
        let resized = frame.resized(4, 3).unwrap();
        assert_eq!(resized.format(), PixelFormat::Gray8);
        assert_eq!(resized.as_bytes().len(), 12);
    }
}
