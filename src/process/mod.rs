//! External process supervision.
//!
//! - `supervisor`: generic launch / readiness / termination of one process
//! - `relay`: ready-made specs for the RTSP relay server and the loop broadcaster
//!
//! Specialised launchers are plain `ProcessSpec` values built by factory
//! functions; there is only one supervisor type.

pub mod relay;
pub mod supervisor;

use std::fmt;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

pub use relay::{loop_broadcast, port_open, rtsp_relay, BroadcastSettings};
pub use supervisor::{OutputSink, ProcessSpec, ProcessSupervisor, ReadinessCheck};

/// Liveness of a supervised process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Running,
    ExitedCleanly,
    /// Non-zero exit; `None` when terminated by a signal.
    ExitedWithError(Option<i32>),
}

impl ProcessStatus {
    /// Non-blocking status query. Query failures count as `Running`; the next poll retries.
    pub(crate) fn of(child: &mut Child) -> Self {
        match child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::from(status),
            Err(e) => {
                log::debug!("try_wait on pid {} failed: {}", child.id(), e);
                ProcessStatus::Running
            }
        }
    }
}

impl From<ExitStatus> for ProcessStatus {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            ProcessStatus::ExitedCleanly
        } else {
            ProcessStatus::ExitedWithError(status.code())
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::NotStarted => write!(f, "not started"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::ExitedCleanly => write!(f, "exit code 0"),
            ProcessStatus::ExitedWithError(Some(code)) => write!(f, "exit code {}", code),
            ProcessStatus::ExitedWithError(None) => write!(f, "killed by signal"),
        }
    }
}

const REAP_POLL: Duration = Duration::from_millis(20);

/// Poll `child` until it exits or `timeout` elapses.
pub(crate) fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                log::debug!("try_wait on pid {} failed: {}", child.id(), e);
                return None;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(REAP_POLL.min(deadline - now));
    }
}

/// Kill `child` if it is still running and reap it.
pub(crate) fn kill_and_reap(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(e) = child.kill() {
        log::debug!("kill pid {} failed: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        log::debug!("wait pid {} failed: {}", child.id(), e);
    }
}
