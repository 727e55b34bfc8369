//! Transcoder command construction.
//!
//! `Transcoder` is the seam between the frame pipes and the external programs that
//! decode, encode and probe video. `Ffmpeg` drives ffmpeg/ffprobe; anything that can
//! stream raw frames over stdin/stdout can stand in for it.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::{MediaError, Result};
use crate::frame::PixelFormat;
use crate::stats::{parse_probe_report, VideoStats};

/// Geometry and format of a raw frame stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamEndpoint {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: Option<f64>,
}

impl StreamEndpoint {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            fps: None,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Exact byte length of one frame on the pipe.
    pub fn frame_len(&self) -> usize {
        self.format.frame_len(self.width, self.height)
    }

    pub fn size_arg(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Output video codec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    /// Uncompressed passthrough; CRF and preset do not apply.
    RawVideo,
    Other(String),
}

impl VideoCodec {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "h264" | "libx264" => VideoCodec::H264,
            "h265" | "hevc" | "libx265" => VideoCodec::H265,
            "raw" | "rawvideo" => VideoCodec::RawVideo,
            other => VideoCodec::Other(other.to_string()),
        }
    }

    pub fn ffmpeg_name(&self) -> &str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::H265 => "libx265",
            VideoCodec::RawVideo => "rawvideo",
            VideoCodec::Other(name) => name,
        }
    }

    fn takes_tuning(&self) -> bool {
        matches!(self, VideoCodec::H264 | VideoCodec::H265)
    }
}

/// Encoder parameters for a `FramePipeWriter`.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodeSettings {
    pub fps: f64,
    /// Pixel format of the encoded output (the pipe itself always carries BGR).
    pub pixel_format: String,
    pub codec: VideoCodec,
    /// Constant rate factor; lower is higher quality.
    pub crf: u8,
    pub preset: String,
}

impl EncodeSettings {
    pub fn new(fps: f64) -> Self {
        Self {
            fps,
            ..Self::default()
        }
    }

    /// Lossless uncompressed output, useful for round trips and tests.
    pub fn raw_passthrough(fps: f64) -> Self {
        Self {
            fps,
            pixel_format: PixelFormat::Bgr24.ffmpeg_name().to_string(),
            codec: VideoCodec::RawVideo,
            ..Self::default()
        }
    }
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            fps: 30.0,
            pixel_format: "yuv420p".to_string(),
            codec: VideoCodec::H264,
            crf: 23,
            preset: "medium".to_string(),
        }
    }
}

/// Builds the external commands behind the frame pipes.
///
/// Returned commands have no stdio configured; the pipes attach their own.
pub trait Transcoder: Send + Sync {
    /// Determine geometry, rate and length of `source`.
    fn probe(&self, source: &str) -> Result<VideoStats>;

    /// Command that writes raw `endpoint` frames of `source` to stdout.
    fn decode_command(&self, source: &str, endpoint: &StreamEndpoint) -> Command;

    /// Command that reads raw BGR `endpoint` frames from stdin and encodes them to `destination`.
    fn encode_command(
        &self,
        destination: &str,
        endpoint: &StreamEndpoint,
        settings: &EncodeSettings,
    ) -> Command;
}

// ----------------------------------------------------------------------------
// ffmpeg
// ----------------------------------------------------------------------------

/// ffmpeg/ffprobe backed transcoder.
#[derive(Clone, Debug)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn probe_args(source: &str) -> Vec<String> {
        to_strings(&[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,pix_fmt,r_frame_rate,avg_frame_rate,nb_frames,duration:format=duration",
            "-of",
            "json",
            source,
        ])
    }

    pub fn decode_args(source: &str, endpoint: &StreamEndpoint) -> Vec<String> {
        let mut args = to_strings(&["-hide_banner", "-loglevel", "error", "-nostdin"]);
        if is_rtsp(source) {
            args.extend(to_strings(&["-rtsp_transport", "tcp"]));
        }
        args.extend(to_strings(&["-i", source, "-an", "-sn"]));
        if let Some(fps) = endpoint.fps {
            args.push("-r".to_string());
            args.push(format_rate(fps));
        }
        args.extend(to_strings(&[
            "-f",
            "rawvideo",
            "-pix_fmt",
            endpoint.format.ffmpeg_name(),
            "-s",
            &endpoint.size_arg(),
            "-",
        ]));
        args
    }

    pub fn encode_args(
        destination: &str,
        endpoint: &StreamEndpoint,
        settings: &EncodeSettings,
    ) -> Vec<String> {
        let mut args = to_strings(&[
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            PixelFormat::Bgr24.ffmpeg_name(),
            "-s",
            &endpoint.size_arg(),
            "-r",
            &format_rate(settings.fps),
            "-i",
            "-",
            "-an",
            "-c:v",
            settings.codec.ffmpeg_name(),
        ]);
        if settings.codec.takes_tuning() {
            args.extend(to_strings(&[
                "-crf",
                &settings.crf.to_string(),
                "-preset",
                &settings.preset,
            ]));
        }
        args.extend(to_strings(&["-pix_fmt", &settings.pixel_format]));
        if is_rtsp(destination) {
            args.extend(to_strings(&["-f", "rtsp", "-rtsp_transport", "tcp"]));
        }
        args.push(destination.to_string());
        args
    }
}

impl Transcoder for Ffmpeg {
    fn probe(&self, source: &str) -> Result<VideoStats> {
        let output = Command::new(&self.ffprobe)
            .args(Self::probe_args(source))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                MediaError::probe(source, format!("cannot run {}: {}", self.ffprobe.display(), e))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::probe(source, stderr.trim().to_string()));
        }
        parse_probe_report(source, &String::from_utf8_lossy(&output.stdout))
    }

    fn decode_command(&self, source: &str, endpoint: &StreamEndpoint) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command.args(Self::decode_args(source, endpoint));
        command
    }

    fn encode_command(
        &self,
        destination: &str,
        endpoint: &StreamEndpoint,
        settings: &EncodeSettings,
    ) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command.args(Self::encode_args(destination, endpoint, settings));
        command
    }
}

/// Probe `source` with the `ffprobe` found on `PATH`.
pub fn probe_video(source: &str) -> Result<VideoStats> {
    Ffmpeg::default().probe(source)
}

fn is_rtsp(location: &str) -> bool {
    location.starts_with("rtsp://") || location.starts_with("rtsps://")
}

fn format_rate(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{:.3}", fps)
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_args_emit_fixed_raw_format() {
        let endpoint = StreamEndpoint::new(640, 480, PixelFormat::Bgr24);
        let args = Ffmpeg::decode_args("clip.mp4", &endpoint);
        let line = args.join(" ");
        assert!(line.contains("-i clip.mp4"));
        assert!(line.ends_with("-f rawvideo -pix_fmt bgr24 -s 640x480 -"));
        assert!(!line.contains("rtsp_transport"));
    }

    #[test]
    fn decode_args_for_live_source_use_tcp() {
        let endpoint = StreamEndpoint::new(320, 240, PixelFormat::Gray8).with_fps(15.0);
        let args = Ffmpeg::decode_args("rtsp://127.0.0.1:8554/stream", &endpoint);
        assert_eq!(&args[4..6], &["-rtsp_transport".to_string(), "tcp".to_string()]);
        let line = args.join(" ");
        assert!(line.contains("-r 15 "));
        assert!(line.contains("-pix_fmt gray"));
    }

    #[test]
    fn encode_args_carry_tuning() {
        let endpoint = StreamEndpoint::new(100, 50, PixelFormat::Bgr24);
        let settings = EncodeSettings {
            crf: 18,
            preset: "veryfast".to_string(),
            ..EncodeSettings::new(29.97)
        };
        let args = Ffmpeg::encode_args("out.mp4", &endpoint, &settings);
        let line = args.join(" ");
        assert!(line.contains("-f rawvideo -pix_fmt bgr24 -s 100x50 -r 29.970 -i -"));
        assert!(line.contains("-c:v libx264 -crf 18 -preset veryfast -pix_fmt yuv420p"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn raw_passthrough_skips_tuning() {
        let endpoint = StreamEndpoint::new(8, 8, PixelFormat::Bgr24);
        let args = Ffmpeg::encode_args("out.nut", &endpoint, &EncodeSettings::raw_passthrough(10.0));
        let line = args.join(" ");
        assert!(line.contains("-c:v rawvideo -pix_fmt bgr24 out.nut"));
        assert!(!line.contains("-crf"));
    }

    #[test]
    fn codec_names_parse() {
        assert_eq!(VideoCodec::from_name("libx264"), VideoCodec::H264);
        assert_eq!(VideoCodec::from_name("HEVC"), VideoCodec::H265);
        assert_eq!(VideoCodec::from_name("rawvideo"), VideoCodec::RawVideo);
        assert_eq!(
            VideoCodec::from_name("mpeg4").ffmpeg_name(),
            "mpeg4"
        );
    }

    #[test]
    fn missing_ffprobe_is_a_probe_error() {
        let ffmpeg = Ffmpeg::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let err = ffmpeg.probe("clip.mp4").unwrap_err();
        assert_eq!(err.code(), "probe");
    }
}
