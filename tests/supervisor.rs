//! Supervisor lifecycle against real child processes.
#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use trailcam::process::{OutputSink, ProcessSpec, ProcessSupervisor};
use trailcam::ProcessStatus;

/// A process that creates `marker` after one second, then idles.
fn marker_writer(marker: &Path) -> ProcessSpec {
    let marker_path = marker.to_path_buf();
    ProcessSpec::new("sh")
        .args(["-c", "sleep 1; touch \"$0\"; exec sleep 30"])
        .arg(marker.display().to_string())
        .stdout(OutputSink::Null)
        .start_wait(Duration::ZERO)
        .poll_interval(Duration::from_millis(200))
        .terminate_timeout(Duration::from_secs(2))
        .ready_check(move || marker_path.exists())
}

#[test]
fn marker_readiness_within_timeout() {
    let dir = TempDir::new().expect("temp dir");
    let marker = dir.path().join("ready");
    let spec = marker_writer(&marker).ready_timeout(Duration::from_secs(2));

    let mut supervisor = ProcessSupervisor::new(spec);
    supervisor.start().expect("ready before timeout");
    assert!(marker.exists());
    assert_eq!(supervisor.status(), ProcessStatus::Running);

    supervisor.stop();
    assert_eq!(supervisor.status(), ProcessStatus::NotStarted);
}

#[test]
fn marker_readiness_times_out() {
    let dir = TempDir::new().expect("temp dir");
    let marker = dir.path().join("ready");
    let spec = marker_writer(&marker).ready_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let mut supervisor = ProcessSupervisor::new(spec);
    let err = supervisor.start().unwrap_err();
    assert_eq!(err.code(), "readiness_timeout");
    assert!(started.elapsed() < Duration::from_secs(1));
    // the unready process was torn down
    assert_eq!(supervisor.status(), ProcessStatus::NotStarted);
}

#[test]
fn scoped_supervisor_stops_on_early_return() {
    fn run_until_error(pid_out: &mut Option<u32>) -> Result<(), String> {
        let spec = ProcessSpec::new("sleep")
            .arg("30")
            .start_wait(Duration::from_millis(50))
            .terminate_timeout(Duration::from_secs(2));
        let supervisor = ProcessSupervisor::launch(spec).map_err(|e| e.to_string())?;
        *pid_out = supervisor.pid();
        Err("body failed".to_string())
    }

    let mut pid = None;
    assert_eq!(run_until_error(&mut pid), Err("body failed".to_string()));
    let pid = pid.expect("process was started") as libc::pid_t;
    // SAFETY: signal 0 only checks for existence.
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!alive, "pid {} still alive after scope exit", pid);
}

#[test]
fn working_directory_and_environment_are_applied() {
    let dir = TempDir::new().expect("temp dir");
    let out = dir.path().join("env.txt");
    let spec = ProcessSpec::new("sh")
        .args(["-c", "printf '%s' \"$TRAILCAM_GREETING\" > env.txt; exec sleep 30"])
        .current_dir(dir.path())
        .env("TRAILCAM_GREETING", "hello")
        .start_wait(Duration::from_millis(10))
        .poll_interval(Duration::from_millis(20))
        .ready_timeout(Duration::from_secs(5))
        .terminate_timeout(Duration::from_secs(2))
        .ready_check({
            let out = out.clone();
            move || std::fs::read_to_string(&out).map(|s| s == "hello").unwrap_or(false)
        });
    let _supervisor = ProcessSupervisor::launch(spec).expect("launch");
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello");
}

#[test]
fn stdout_and_stderr_can_share_one_log_file() {
    let dir = TempDir::new().expect("temp dir");
    let log = dir.path().join("child.log");
    let spec = ProcessSpec::new("sh")
        .args(["-c", "echo out; echo err >&2"])
        .stdout(OutputSink::File(log.clone()))
        .stderr(OutputSink::File(log.clone()))
        .start_wait(Duration::from_millis(300));
    let mut supervisor = ProcessSupervisor::launch(spec).expect("clean exit during warm-up");
    supervisor.stop();
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "out\nerr\n");
}
