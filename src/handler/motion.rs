use super::FrameHandler;
use crate::frame::{Frame, PixelFormat};

pub const DEFAULT_HISTORY: u32 = 500;
pub const DEFAULT_THRESHOLD: u8 = 16;
pub const DEFAULT_KERNEL_SIZE: usize = 3;

const FOREGROUND: u8 = 255;

/// Background-subtraction motion detector.
///
/// Keeps a per-pixel running average of luma over roughly the last `history`
/// frames. A pixel is foreground when it differs from the background by more
/// than `threshold`. The resulting mask is despeckled with a morphological
/// open then close using a square `kernel_size` window (0 disables it).
///
/// Output frames are single-channel masks (0 or 255) carrying the input's
/// sequence number.
pub struct MotionMask {
    history: u32,
    threshold: u8,
    kernel_size: usize,
    background: Vec<f32>,
    dims: (u32, u32),
    seen: u64,
    last_proportion: Option<f64>,
}

impl MotionMask {
    pub fn new(history: u32, threshold: u8, kernel_size: usize) -> Self {
        Self {
            history: history.max(1),
            threshold,
            kernel_size,
            background: Vec::new(),
            dims: (0, 0),
            seen: 0,
            last_proportion: None,
        }
    }

    /// Moving share of the most recent mask, in `[0, 1]`.
    ///
    /// `None` until more than `history` frames have been seen, while the
    /// background model is still settling.
    pub fn last_proportion(&self) -> Option<f64> {
        self.last_proportion
    }

    fn learning_rate(&self) -> f32 {
        1.0 / (self.seen.min(self.history as u64).max(1) as f32)
    }

    fn reset(&mut self, width: u32, height: u32) {
        self.background.clear();
        self.dims = (width, height);
        self.seen = 0;
        self.last_proportion = None;
    }
}

impl Default for MotionMask {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY, DEFAULT_THRESHOLD, DEFAULT_KERNEL_SIZE)
    }
}

impl FrameHandler for MotionMask {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn handle(&mut self, frame: Frame) -> Option<Frame> {
        let (width, height) = (frame.width(), frame.height());
        if self.dims != (width, height) {
            self.reset(width, height);
        }
        let luma = luma_plane(&frame);
        self.seen += 1;

        let mut mask = if self.background.is_empty() {
            self.background = luma.iter().map(|&v| v as f32).collect();
            vec![0u8; luma.len()]
        } else {
            let threshold = self.threshold as f32;
            let rate = self.learning_rate();
            luma.iter()
                .zip(self.background.iter_mut())
                .map(|(&value, bg)| {
                    let value = value as f32;
                    let moving = (value - *bg).abs() > threshold;
                    *bg += (value - *bg) * rate;
                    if moving {
                        FOREGROUND
                    } else {
                        0
                    }
                })
                .collect()
        };

        if self.kernel_size > 0 {
            let (w, h, k) = (width as usize, height as usize, self.kernel_size);
            // open removes specks, close fills pinholes
            mask = dilate(&erode(&mask, w, h, k), w, h, k);
            mask = erode(&dilate(&mask, w, h, k), w, h, k);
        }

        self.last_proportion = (self.seen > self.history as u64).then(|| {
            let moving = mask.iter().filter(|&&v| v == FOREGROUND).count();
            moving as f64 / mask.len() as f64
        });

        match Frame::new(mask, width, height, PixelFormat::Gray8, frame.seq()) {
            Ok(out) => Some(out),
            Err(e) => {
                log::warn!("motion mask for frame {} rejected: {}", frame.seq(), e);
                None
            }
        }
    }
}

/// Integer BT.601 luma from BGR(A), or the plane itself for greyscale.
fn luma_plane(frame: &Frame) -> Vec<u8> {
    let bytes = frame.as_bytes();
    match frame.format() {
        PixelFormat::Gray8 => bytes.to_vec(),
        PixelFormat::Bgr24 | PixelFormat::Bgra32 => bytes
            .chunks_exact(frame.channels())
            .map(|px| {
                let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
                ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8
            })
            .collect(),
    }
}

// ----------------------------------------------------------------------------
// Morphology (separable square window, out-of-image pixels ignored)
// ----------------------------------------------------------------------------

fn erode(src: &[u8], width: usize, height: usize, kernel: usize) -> Vec<u8> {
    window_filter(src, width, height, kernel, u8::MAX, u8::min)
}

fn dilate(src: &[u8], width: usize, height: usize, kernel: usize) -> Vec<u8> {
    window_filter(src, width, height, kernel, u8::MIN, u8::max)
}

fn window_filter(
    src: &[u8],
    width: usize,
    height: usize,
    kernel: usize,
    identity: u8,
    op: fn(u8, u8) -> u8,
) -> Vec<u8> {
    let before = kernel / 2;
    let after = kernel - 1 - before;

    let mut rows = vec![0u8; src.len()];
    for y in 0..height {
        let row = &src[y * width..(y + 1) * width];
        for x in 0..width {
            let lo = x.saturating_sub(before);
            let hi = (x + after).min(width - 1);
            rows[y * width + x] = row[lo..=hi].iter().fold(identity, |acc, &v| op(acc, v));
        }
    }

    let mut out = vec![0u8; src.len()];
    for x in 0..width {
        for y in 0..height {
            let lo = y.saturating_sub(before);
            let hi = (y + after).min(height - 1);
            out[y * width + x] = (lo..=hi).fold(identity, |acc, yy| op(acc, rows[yy * width + x]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grey(width: u32, height: u32, fill: impl Fn(u32, u32) -> u8, seq: u64) -> Frame {
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| fill(x, y))
            .collect();
        Frame::new(data, width, height, PixelFormat::Gray8, seq).unwrap()
    }

    #[test]
    fn static_scene_has_no_motion() {
        let mut motion = MotionMask::new(3, 16, 3);
        for seq in 0..6 {
            let mask = motion.handle(grey(16, 16, |_, _| 80, seq)).unwrap();
            assert_eq!(mask.format(), PixelFormat::Gray8);
            assert!(mask.as_bytes().iter().all(|&v| v == 0));
        }
        assert_eq!(motion.last_proportion(), Some(0.0));
    }

    #[test]
    fn proportion_waits_for_history() {
        let mut motion = MotionMask::new(4, 16, 0);
        for seq in 0..4 {
            motion.handle(grey(8, 8, |_, _| 10, seq));
            assert_eq!(motion.last_proportion(), None);
        }
        motion.handle(grey(8, 8, |_, _| 10, 4));
        assert!(motion.last_proportion().is_some());
    }

    #[test]
    fn moving_block_is_detected() {
        let mut motion = MotionMask::new(2, 16, 3);
        for seq in 0..5 {
            motion.handle(grey(20, 20, |_, _| 20, seq));
        }
        // 8x8 bright block on a 20x20 frame
        let mask = motion
            .handle(grey(20, 20, |x, y| if (4..12).contains(&x) && (4..12).contains(&y) { 220 } else { 20 }, 5))
            .unwrap();
        assert_eq!(mask.seq(), 5);
        assert_eq!(mask.as_bytes()[8 * 20 + 8], FOREGROUND);
        assert_eq!(mask.as_bytes()[0], 0);
        let proportion = motion.last_proportion().unwrap();
        assert!((proportion - 64.0 / 400.0).abs() < 1e-9, "{}", proportion);
    }

    #[test]
    fn opening_removes_isolated_speck() {
        let mut motion = MotionMask::new(1, 16, 3);
        motion.handle(grey(9, 9, |_, _| 0, 0));
        let speck = motion
            .handle(grey(9, 9, |x, y| if x == 4 && y == 4 { 255 } else { 0 }, 1))
            .unwrap();
        assert!(speck.as_bytes().iter().all(|&v| v == 0));
    }

    #[test]
    fn colour_frames_are_reduced_to_luma() {
        let frame = Frame::new(vec![255, 0, 0, 0, 0, 255], 2, 1, PixelFormat::Bgr24, 0).unwrap();
        assert_eq!(luma_plane(&frame), vec![29, 76]);
    }
}
