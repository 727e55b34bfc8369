//! Video source metadata.
//!
//! `VideoStats` is what the probe reports about a source: geometry, frame rate,
//! frame count and colourspace. The probe itself is an external program (ffprobe);
//! this module owns the parsing of its JSON report.

use serde::Deserialize;

use crate::error::{MediaError, Result};
use crate::frame::PixelFormat;

/// Colour layout of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Colourspace {
    Rgb,
    Greyscale,
}

impl Colourspace {
    pub fn channels(self) -> usize {
        match self {
            Colourspace::Rgb => 3,
            Colourspace::Greyscale => 1,
        }
    }

    pub fn pixel_format(self) -> PixelFormat {
        match self {
            Colourspace::Rgb => PixelFormat::Bgr24,
            Colourspace::Greyscale => PixelFormat::Gray8,
        }
    }
}

/// Metadata about a video source, typically a file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoStats {
    pub fps: f64,
    /// Total frames; zero when the container does not say (live streams).
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
    pub colourspace: Colourspace,
}

impl VideoStats {
    /// (height, width, channels), matching the frame buffer layout.
    pub fn shape(&self) -> (u32, u32, usize) {
        (self.height, self.width, self.colourspace.channels())
    }

    /// Bytes in one raw frame.
    pub fn nbytes(&self) -> usize {
        self.width as usize * self.height as usize * self.colourspace.channels()
    }

    /// Duration of one frame in whole milliseconds (rounded down).
    pub fn frame_duration_ms(&self) -> u64 {
        if self.fps <= 0.0 {
            return 0;
        }
        (1000.0 / self.fps) as u64
    }

    pub fn duration_secs(&self) -> f64 {
        if self.fps <= 0.0 {
            return 0.0;
        }
        self.frame_count as f64 / self.fps
    }
}

// ----------------------------------------------------------------------------
// ffprobe report parsing
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProbeReport {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    nb_read_frames: Option<String>,
    duration: Option<String>,
}

/// Parse the JSON printed by `ffprobe -of json -show_entries stream=...`.
pub fn parse_probe_report(source: &str, json: &str) -> Result<VideoStats> {
    let report: ProbeReport = serde_json::from_str(json)
        .map_err(|e| MediaError::probe(source, format!("unreadable probe report: {}", e)))?;
    let container_duration = report.format.and_then(|f| f.duration);
    let stream = report
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| MediaError::probe(source, "no video stream"))?;

    let width = stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| MediaError::probe(source, "missing frame width"))?;
    let height = stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| MediaError::probe(source, "missing frame height"))?;
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .ok_or_else(|| MediaError::probe(source, "missing frame rate"))?;
    let frame_count = stream
        .nb_read_frames
        .as_deref()
        .or(stream.nb_frames.as_deref())
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| {
            // mkv, webm and ts carry no count; estimate it from the duration
            stream
                .duration
                .as_deref()
                .or(container_duration.as_deref())
                .and_then(parse_seconds)
                .map(|secs| (secs * fps).floor() as u64)
        })
        .unwrap_or(0);
    let colourspace = match stream.pix_fmt.as_deref() {
        Some(fmt) if fmt.starts_with("gray") => Colourspace::Greyscale,
        _ => Colourspace::Rgb,
    };

    Ok(VideoStats {
        fps,
        frame_count,
        width,
        height,
        colourspace,
    })
}

/// Parse a duration such as "12.500000". "N/A" and negative values yield `None`.
fn parse_seconds(raw: &str) -> Option<f64> {
    let secs: f64 = raw.trim().parse().ok()?;
    (secs.is_finite() && secs > 0.0).then_some(secs)
}

/// Parse "30000/1001" or "25" into frames per second. Zero rates are rejected.
fn parse_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT_4K: &str = r#"{
        "programs": [],
        "streams": [
            {
                "width": 3840,
                "height": 2160,
                "pix_fmt": "yuv420p",
                "r_frame_rate": "30/1",
                "avg_frame_rate": "30/1",
                "nb_frames": "150"
            }
        ]
    }"#;

    #[test]
    fn parses_file_report() {
        let stats = parse_probe_report("test.mp4", REPORT_4K).unwrap();
        assert_eq!(stats.width, 3840);
        assert_eq!(stats.height, 2160);
        assert_eq!(stats.colourspace, Colourspace::Rgb);
        assert_eq!(stats.fps, 30.0);
        assert_eq!(stats.frame_count, 150);
        assert_eq!(stats.shape(), (2160, 3840, 3));
        assert_eq!(stats.nbytes(), 2160 * 3840 * 3);
        assert_eq!(stats.frame_duration_ms(), 1000 / 30);
        assert_eq!(stats.duration_secs(), 5.0);
    }

    #[test]
    fn live_report_without_frame_count() {
        let json = r#"{"streams":[{"width":640,"height":480,"pix_fmt":"gray","r_frame_rate":"30000/1001","avg_frame_rate":"0/0"}]}"#;
        let stats = parse_probe_report("rtsp://cam", json).unwrap();
        assert_eq!(stats.frame_count, 0);
        assert_eq!(stats.colourspace, Colourspace::Greyscale);
        assert!((stats.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn frame_count_estimated_from_duration() {
        let mkv = r#"{
            "streams": [{"width": 1920, "height": 1080, "pix_fmt": "yuv420p",
                         "r_frame_rate": "30/1", "avg_frame_rate": "30/1"}],
            "format": {"duration": "12.345000"}
        }"#;
        let stats = parse_probe_report("clip.mkv", mkv).unwrap();
        assert_eq!(stats.frame_count, 370);

        // stream duration wins over the container's
        let ts = r#"{
            "streams": [{"width": 640, "height": 360, "avg_frame_rate": "25/1",
                         "duration": "4.000000"}],
            "format": {"duration": "4.500000"}
        }"#;
        assert_eq!(parse_probe_report("clip.ts", ts).unwrap().frame_count, 100);

        let unknown = r#"{
            "streams": [{"width": 640, "height": 360, "avg_frame_rate": "25/1",
                         "duration": "N/A"}]
        }"#;
        assert_eq!(parse_probe_report("live.ts", unknown).unwrap().frame_count, 0);
    }

    #[test]
    fn empty_report_is_a_probe_error() {
        let err = parse_probe_report("nothing.txt", r#"{"streams": []}"#).unwrap_err();
        assert_eq!(err.code(), "probe");
        let err = parse_probe_report("garbage", "not json").unwrap_err();
        assert_eq!(err.code(), "probe");
    }
}
