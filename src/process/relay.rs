//! RTSP relay and loop-broadcast launchers.
//!
//! Both are plain `ProcessSpec` values for the generic supervisor:
//! - `rtsp_relay`: the MediaMTX server, ready once its RTSP port accepts connections
//! - `loop_broadcast`: ffmpeg replaying a file forever, in real time, into the relay

use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use super::supervisor::ProcessSpec;
use crate::config::{RelaySettings, SupervisorSettings};

const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Lightweight readiness probe: true when a TCP connection to `host:port` succeeds.
pub fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

/// Spec for the RTSP relay server.
pub fn rtsp_relay(relay: &RelaySettings, timings: &SupervisorSettings) -> ProcessSpec {
    let mut spec = ProcessSpec::new(relay.binary.clone());
    if let Some(config) = &relay.config {
        spec = spec.arg(config.display().to_string());
    }
    let host = relay.host.clone();
    let port = relay.port;
    timings
        .apply(spec)
        .ready_check(move || port_open(&host, port, PORT_CHECK_TIMEOUT))
}

/// What the loop broadcaster plays and where it publishes.
#[derive(Clone, Debug)]
pub struct BroadcastSettings {
    pub ffmpeg: String,
    pub input: PathBuf,
    pub url: String,
}

impl BroadcastSettings {
    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-re", "-stream_loop", "-1", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(self.input.display().to_string());
        args.extend(
            [
                "-an",
                "-c:v",
                "libx264",
                "-tune",
                "fastdecode",
                "-f",
                "rtsp",
                "-rtsp_transport",
                "tcp",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(self.url.clone());
        args
    }
}

/// Spec for an ffmpeg process looping `input` into the relay at real-time speed.
///
/// There is no readiness check: the relay accepts the publisher immediately and
/// readers see the stream once the first keyframe arrives.
pub fn loop_broadcast(broadcast: &BroadcastSettings, timings: &SupervisorSettings) -> ProcessSpec {
    log::debug!("broadcast command: {} {}", broadcast.ffmpeg, broadcast.args().join(" "));
    timings.apply(ProcessSpec::new(broadcast.ffmpeg.clone()).args(broadcast.args()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn timings() -> SupervisorSettings {
        SupervisorSettings {
            start_wait: Duration::from_millis(10),
            poll_interval: Duration::from_millis(20),
            ready_timeout: Duration::from_millis(500),
            terminate_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn port_open_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_open("127.0.0.1", port, Duration::from_millis(200)));
        drop(listener);
        assert!(!port_open("127.0.0.1", port, Duration::from_millis(200)));
    }

    #[test]
    fn relay_spec_checks_configured_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let relay = RelaySettings {
            binary: "mediamtx".to_string(),
            config: Some(PathBuf::from("/etc/mediamtx.yml")),
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            stream_path: "stream".to_string(),
        };
        let spec = rtsp_relay(&relay, &timings());
        assert_eq!(spec.command_line(), "mediamtx /etc/mediamtx.yml");
        assert_eq!(spec.ready_timeout, Duration::from_millis(500));
        let check = spec.ready_check.expect("readiness check");
        assert!(check());
    }

    #[test]
    fn broadcast_loops_input_into_url() {
        let broadcast = BroadcastSettings {
            ffmpeg: "ffmpeg".to_string(),
            input: PathBuf::from("clip.mp4"),
            url: "rtsp://127.0.0.1:8554/stream".to_string(),
        };
        let spec = loop_broadcast(&broadcast, &timings());
        assert_eq!(spec.program, "ffmpeg");
        assert!(spec.ready_check.is_none());
        let line = spec.command_line();
        assert!(line.contains("-re -stream_loop -1 -i clip.mp4"));
        assert!(line.contains("-tune fastdecode"));
        assert!(line.ends_with("-f rtsp -rtsp_transport tcp rtsp://127.0.0.1:8554/stream"));
    }
}
