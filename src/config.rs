use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::GrabberConfig;
use crate::pipe::{EncodeSettings, VideoCodec};
use crate::process::ProcessSpec;

const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_FFPROBE: &str = "ffprobe";
const DEFAULT_RELAY_BINARY: &str = "mediamtx";
const DEFAULT_RELAY_HOST: &str = "127.0.0.1";
const DEFAULT_RELAY_PORT: u16 = 8554;
const DEFAULT_STREAM_PATH: &str = "stream";
const DEFAULT_START_WAIT_MS: u64 = 1_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_READY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TERMINATE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_GRAB_PAUSE_MS: u64 = 10;
const DEFAULT_CRF: u8 = 23;
const DEFAULT_PRESET: &str = "medium";
const DEFAULT_OUTPUT_PIX_FMT: &str = "yuv420p";
const MAX_CRF: u8 = 51;

#[derive(Debug, Deserialize, Default)]
struct TrailcamConfigFile {
    ffmpeg: Option<String>,
    ffprobe: Option<String>,
    relay: Option<RelayConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    grabber: Option<GrabberConfigFile>,
    encode: Option<EncodeConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    binary: Option<String>,
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    stream_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    start_wait_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    ready_timeout_ms: Option<u64>,
    terminate_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct GrabberConfigFile {
    close_timeout_ms: Option<u64>,
    grab_pause_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EncodeConfigFile {
    codec: Option<String>,
    crf: Option<u8>,
    preset: Option<String>,
    pixel_format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrailcamConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub relay: RelaySettings,
    pub supervisor: SupervisorSettings,
    pub grabber: GrabberSettings,
    pub encode: EncodeDefaults,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub binary: String,
    pub config: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub stream_path: String,
}

impl RelaySettings {
    pub fn rtsp_url(&self) -> String {
        format!("rtsp://{}:{}/{}", self.host, self.port, self.stream_path)
    }
}

/// Timing parameters applied to every supervised process the CLI launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub start_wait: Duration,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl SupervisorSettings {
    pub fn apply(&self, spec: ProcessSpec) -> ProcessSpec {
        spec.start_wait(self.start_wait)
            .poll_interval(self.poll_interval)
            .ready_timeout(self.ready_timeout)
            .terminate_timeout(self.terminate_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrabberSettings {
    pub close_timeout: Duration,
    /// Zero disables the pause between grabs.
    pub grab_pause: Duration,
}

impl GrabberSettings {
    pub fn grabber_config(&self) -> GrabberConfig {
        GrabberConfig {
            termination_timeout: self.close_timeout,
            grab_pause: (!self.grab_pause.is_zero()).then_some(self.grab_pause),
            ..GrabberConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeDefaults {
    pub codec: VideoCodec,
    pub crf: u8,
    pub preset: String,
    pub pixel_format: String,
}

impl EncodeDefaults {
    pub fn settings(&self, fps: f64) -> EncodeSettings {
        EncodeSettings {
            fps,
            pixel_format: self.pixel_format.clone(),
            codec: self.codec.clone(),
            crf: self.crf,
            preset: self.preset.clone(),
        }
    }
}

impl Default for TrailcamConfig {
    fn default() -> Self {
        // Infallible: an empty file only yields defaults.
        Self::from_file(TrailcamConfigFile::default())
    }
}

impl TrailcamConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRAILCAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrailcamConfigFile) -> Self {
        let relay = file.relay.unwrap_or_default();
        let supervisor = file.supervisor.unwrap_or_default();
        let grabber = file.grabber.unwrap_or_default();
        let encode = file.encode.unwrap_or_default();
        Self {
            ffmpeg: file.ffmpeg.unwrap_or_else(|| DEFAULT_FFMPEG.to_string()),
            ffprobe: file.ffprobe.unwrap_or_else(|| DEFAULT_FFPROBE.to_string()),
            relay: RelaySettings {
                binary: relay
                    .binary
                    .unwrap_or_else(|| DEFAULT_RELAY_BINARY.to_string()),
                config: relay.config,
                host: relay.host.unwrap_or_else(|| DEFAULT_RELAY_HOST.to_string()),
                port: relay.port.unwrap_or(DEFAULT_RELAY_PORT),
                stream_path: relay
                    .stream_path
                    .unwrap_or_else(|| DEFAULT_STREAM_PATH.to_string()),
            },
            supervisor: SupervisorSettings {
                start_wait: millis(supervisor.start_wait_ms, DEFAULT_START_WAIT_MS),
                poll_interval: millis(supervisor.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS),
                ready_timeout: millis(supervisor.ready_timeout_ms, DEFAULT_READY_TIMEOUT_MS),
                terminate_timeout: millis(
                    supervisor.terminate_timeout_ms,
                    DEFAULT_TERMINATE_TIMEOUT_MS,
                ),
            },
            grabber: GrabberSettings {
                close_timeout: millis(grabber.close_timeout_ms, DEFAULT_CLOSE_TIMEOUT_MS),
                grab_pause: millis(grabber.grab_pause_ms, DEFAULT_GRAB_PAUSE_MS),
            },
            encode: EncodeDefaults {
                codec: encode
                    .codec
                    .as_deref()
                    .map(VideoCodec::from_name)
                    .unwrap_or_default(),
                crf: encode.crf.unwrap_or(DEFAULT_CRF),
                preset: encode.preset.unwrap_or_else(|| DEFAULT_PRESET.to_string()),
                pixel_format: encode
                    .pixel_format
                    .unwrap_or_else(|| DEFAULT_OUTPUT_PIX_FMT.to_string()),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(ffmpeg) = non_empty_env("TRAILCAM_FFMPEG") {
            self.ffmpeg = ffmpeg;
        }
        if let Some(ffprobe) = non_empty_env("TRAILCAM_FFPROBE") {
            self.ffprobe = ffprobe;
        }
        if let Some(binary) = non_empty_env("TRAILCAM_RELAY_BIN") {
            self.relay.binary = binary;
        }
        if let Some(config) = non_empty_env("TRAILCAM_RELAY_CONFIG") {
            self.relay.config = Some(PathBuf::from(config));
        }
        if let Some(port) = non_empty_env("TRAILCAM_RTSP_PORT") {
            self.relay.port = port
                .parse()
                .map_err(|_| anyhow!("TRAILCAM_RTSP_PORT must be a port number"))?;
        }
        if let Some(wait) = non_empty_env("TRAILCAM_START_WAIT_MS") {
            self.supervisor.start_wait = parse_millis("TRAILCAM_START_WAIT_MS", &wait)?;
        }
        if let Some(timeout) = non_empty_env("TRAILCAM_READY_TIMEOUT_MS") {
            self.supervisor.ready_timeout = parse_millis("TRAILCAM_READY_TIMEOUT_MS", &timeout)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.relay.port == 0 {
            return Err(anyhow!("relay port must be greater than zero"));
        }
        if self.supervisor.poll_interval.is_zero() {
            return Err(anyhow!("supervisor poll interval must be greater than zero"));
        }
        if self.supervisor.ready_timeout.is_zero() {
            return Err(anyhow!("supervisor ready timeout must be greater than zero"));
        }
        if self.grabber.close_timeout.is_zero() {
            return Err(anyhow!("grabber close timeout must be greater than zero"));
        }
        if self.encode.crf > MAX_CRF {
            return Err(anyhow!("encoder crf must be between 0 and {}", MAX_CRF));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<TrailcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn millis(value: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default_ms))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    let ms: u64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be an integer number of milliseconds", key))?;
    Ok(Duration::from_millis(ms))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
