use super::FrameHandler;
use crate::error::{MediaError, Result};
use crate::frame::Frame;
use crate::stats::VideoStats;

// Absorbs float drift when source and target rates are equal or exact multiples.
const EPSILON_MS: f64 = 1e-9;

/// Resizes frames and decimates the frame rate.
///
/// Each input frame advances a clock by the source frame time; a frame is
/// emitted (resized) whenever the clock has covered one target frame time, and
/// dropped otherwise. Upsampling the frame rate is not possible: a target above
/// the source rate emits every frame.
#[derive(Clone, Debug)]
pub struct Rescaler {
    width: u32,
    height: u32,
    fps: f64,
    source_frame_ms: f64,
    target_frame_ms: f64,
    clock_ms: f64,
}

impl Rescaler {
    /// Unset targets default to the source's own geometry and rate.
    pub fn new(
        stats: &VideoStats,
        width: Option<u32>,
        height: Option<u32>,
        fps: Option<f64>,
    ) -> Result<Self> {
        let width = width.unwrap_or(stats.width);
        let height = height.unwrap_or(stats.height);
        let fps = fps.unwrap_or(stats.fps);
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidFrame(format!(
                "cannot rescale to {}x{}",
                width, height
            )));
        }
        if !positive_rate(fps) || !positive_rate(stats.fps) {
            return Err(MediaError::InvalidFrame(format!(
                "frame rates must be positive (source {}, target {})",
                stats.fps, fps
            )));
        }
        Ok(Self {
            width,
            height,
            fps,
            source_frame_ms: 1000.0 / stats.fps,
            target_frame_ms: 1000.0 / fps,
            clock_ms: 0.0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Output frame rate.
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// How many frames an input of `input_frames` frames produces.
    pub fn expected_output_frames(&self, input_frames: u64) -> u64 {
        let ratio = (self.source_frame_ms / self.target_frame_ms).min(1.0);
        (ratio * input_frames as f64 + EPSILON_MS).floor() as u64
    }
}

impl FrameHandler for Rescaler {
    fn name(&self) -> &'static str {
        "rescale"
    }

    fn handle(&mut self, frame: Frame) -> Option<Frame> {
        self.clock_ms += self.source_frame_ms;
        if self.clock_ms + EPSILON_MS < self.target_frame_ms {
            return None;
        }
        self.clock_ms = (self.clock_ms - self.target_frame_ms).min(self.target_frame_ms);
        match frame.resized(self.width, self.height) {
            Ok(resized) => Some(resized),
            Err(e) => {
                log::warn!("dropping frame {}: {}", frame.seq(), e);
                None
            }
        }
    }
}

fn positive_rate(fps: f64) -> bool {
    fps.is_finite() && fps > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::stats::Colourspace;

    fn stats(fps: f64) -> VideoStats {
        VideoStats {
            fps,
            frame_count: 300,
            width: 64,
            height: 48,
            colourspace: Colourspace::Rgb,
        }
    }

    fn run(rescaler: &mut Rescaler, frames: u64) -> Vec<Frame> {
        (0..frames)
            .filter_map(|seq| rescaler.handle(Frame::filled(64, 48, PixelFormat::Bgr24, 9, seq)))
            .collect()
    }

    #[test]
    fn defaults_pass_everything_through() {
        let mut rescaler = Rescaler::new(&stats(30.0), None, None, None).unwrap();
        let out = run(&mut rescaler, 30);
        assert_eq!(out.len(), 30);
        assert_eq!(out[0].shape(), (48, 64, 3));
    }

    #[test]
    fn halving_fps_keeps_every_other_frame() {
        let mut rescaler = Rescaler::new(&stats(30.0), Some(32), Some(24), Some(15.0)).unwrap();
        let out = run(&mut rescaler, 30);
        assert_eq!(out.len(), 15);
        assert_eq!(out[0].seq(), 1);
        assert_eq!(out[1].seq(), 3);
        assert_eq!((out[0].width(), out[0].height()), (32, 24));
        assert_eq!(rescaler.expected_output_frames(30), 15);
    }

    #[test]
    fn uneven_ratio_spreads_output() {
        let mut rescaler = Rescaler::new(&stats(25.0), None, None, Some(10.0)).unwrap();
        let out = run(&mut rescaler, 25);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn target_above_source_emits_every_frame() {
        let mut rescaler = Rescaler::new(&stats(10.0), None, None, Some(30.0)).unwrap();
        assert_eq!(run(&mut rescaler, 12).len(), 12);
        assert_eq!(rescaler.expected_output_frames(12), 12);
    }

    #[test]
    fn rejects_zero_targets() {
        assert!(Rescaler::new(&stats(30.0), Some(0), None, None).is_err());
        assert!(Rescaler::new(&stats(30.0), None, None, Some(0.0)).is_err());
    }
}
