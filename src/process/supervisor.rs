//! Supervised external process.
//!
//! A `ProcessSupervisor` owns exactly one child process described by a `ProcessSpec`.
//! Starting waits a warm-up period and then polls an optional readiness predicate;
//! stopping asks the process to terminate, waits, and force-kills as a last resort.
//!
//! The supervisor stops its process on `Drop`, so a supervisor held in a scope
//! tears the process down on every exit path, including `?` and panics. `stop()`
//! never returns an error and therefore cannot mask one already propagating.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{wait_with_timeout, ProcessStatus};
use crate::error::{MediaError, Result};

pub const DEFAULT_START_WAIT: Duration = Duration::from_secs(15);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period after a forced kill before the child is abandoned.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Caller-supplied readiness check, e.g. a port reachability probe.
pub type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Where a child's stdout/stderr goes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputSink {
    #[default]
    Inherit,
    Null,
    /// Truncate and write to this file.
    File(PathBuf),
}

impl OutputSink {
    fn to_stdio(&self) -> Result<Stdio> {
        Ok(match self {
            OutputSink::Inherit => Stdio::inherit(),
            OutputSink::Null => Stdio::null(),
            OutputSink::File(path) => Stdio::from(File::create(path)?),
        })
    }
}

// ----------------------------------------------------------------------------
// ProcessSpec
// ----------------------------------------------------------------------------

/// Everything needed to launch and supervise one process.
///
/// Defaults: `start_wait` 15s, `poll_interval` 200ms, `ready_timeout` 10s,
/// `terminate_timeout` 5s, no readiness check, output inherited.
#[derive(Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    pub start_wait: Duration,
    pub poll_interval: Duration,
    pub ready_check: Option<ReadinessCheck>,
    pub ready_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdout: OutputSink::Inherit,
            stderr: OutputSink::Inherit,
            start_wait: DEFAULT_START_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready_check: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdout(mut self, sink: OutputSink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: OutputSink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn start_wait(mut self, wait: Duration) -> Self {
        self.start_wait = wait;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn ready_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.ready_check = Some(Arc::new(check));
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Human-readable command line for logs and errors.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build_command(&self) -> Result<Command> {
        let (stdout, stderr) = match (&self.stdout, &self.stderr) {
            // one handle, so both streams share the file offset
            (OutputSink::File(out), OutputSink::File(err)) if out == err => {
                let file = File::create(out)?;
                (Stdio::from(file.try_clone()?), Stdio::from(file))
            }
            (out, err) => (out.to_stdio()?, err.to_stdio()?),
        };
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        Ok(command)
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("start_wait", &self.start_wait)
            .field("poll_interval", &self.poll_interval)
            .field("ready_check", &self.ready_check.is_some())
            .field("ready_timeout", &self.ready_timeout)
            .field("terminate_timeout", &self.terminate_timeout)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// ProcessSupervisor
// ----------------------------------------------------------------------------

/// Owner of one supervised child process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    spec: ProcessSpec,
    child: Option<Child>,
}

impl ProcessSupervisor {
    pub fn new(spec: ProcessSpec) -> Self {
        Self { spec, child: None }
    }

    /// Construct and start in one step. The returned supervisor stops the process on drop.
    pub fn launch(spec: ProcessSpec) -> Result<Self> {
        let mut supervisor = Self::new(spec);
        supervisor.start()?;
        Ok(supervisor)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Liveness of the supervised process. Reaps it if it has exited.
    pub fn status(&mut self) -> ProcessStatus {
        match self.child.as_mut() {
            None => ProcessStatus::NotStarted,
            Some(child) => ProcessStatus::of(child),
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// Launch the process, wait for warm-up, then poll readiness if configured.
    ///
    /// A no-op when the process is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            log::debug!("'{}' already running", self.spec.program);
            return Ok(());
        }
        self.child = None;

        let mut command = self.spec.build_command()?;
        let child = command.spawn().map_err(|cause| MediaError::Spawn {
            program: self.spec.program.clone(),
            cause,
        })?;
        log::info!("started '{}' (pid {})", self.spec.command_line(), child.id());
        self.child = Some(child);

        thread::sleep(self.spec.start_wait);

        match self.spec.ready_check.clone() {
            Some(check) => self.wait_until_ready(check.as_ref()),
            None => match self.status() {
                ProcessStatus::ExitedWithError(_) => Err(self.startup_failed()),
                ProcessStatus::ExitedCleanly => {
                    log::warn!("'{}' exited during warm-up", self.spec.program);
                    self.child = None;
                    Ok(())
                }
                _ => Ok(()),
            },
        }
    }

    fn wait_until_ready(&mut self, check: &(dyn Fn() -> bool + Send + Sync)) -> Result<()> {
        let deadline = Instant::now() + self.spec.ready_timeout;
        loop {
            if self.status() != ProcessStatus::Running {
                return Err(self.startup_failed());
            }
            if check() {
                log::info!("'{}' is ready", self.spec.program);
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "'{}' not ready after {:?}; stopping it",
                    self.spec.program,
                    self.spec.ready_timeout
                );
                self.stop();
                return Err(MediaError::ReadinessTimeout {
                    command: self.spec.command_line(),
                    timeout: self.spec.ready_timeout,
                });
            }
            thread::sleep(self.spec.poll_interval.min(deadline - now));
        }
    }

    /// Build the startup error and forget the (already exited) child.
    fn startup_failed(&mut self) -> MediaError {
        let status = self.status();
        self.child = None;
        MediaError::Startup {
            command: self.spec.command_line(),
            status: status.to_string(),
        }
    }

    /// Terminate gracefully, then forcibly. Idempotent and infallible.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let program = &self.spec.program;
        match child.try_wait() {
            Ok(Some(status)) => {
                log::debug!("'{}' had already exited ({})", program, status);
                return;
            }
            Ok(None) => {}
            Err(e) => log::debug!("'{}' status unavailable: {}", program, e),
        }

        request_termination(&mut child);
        if let Some(status) = wait_with_timeout(&mut child, self.spec.terminate_timeout) {
            log::info!("'{}' stopped ({})", program, status);
            return;
        }

        log::warn!(
            "'{}' ignored termination for {:?}; killing",
            program,
            self.spec.terminate_timeout
        );
        if let Err(e) = child.kill() {
            log::debug!("kill '{}' failed: {}", program, e);
        }
        if wait_with_timeout(&mut child, KILL_WAIT).is_none() {
            log::debug!("'{}' (pid {}) not reaped after kill", program, child.id());
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: `pid` belongs to a child we own and have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        log::debug!(
            "SIGTERM to pid {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("terminate pid {} failed: {}", child.id(), e);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shell(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh")
            .arg("-c")
            .arg(script)
            .start_wait(Duration::ZERO)
            .poll_interval(Duration::from_millis(50))
            .terminate_timeout(Duration::from_secs(2))
    }

    #[test]
    fn readiness_timeout_is_bounded() {
        let spec = shell("exec sleep 30")
            .ready_check(|| false)
            .ready_timeout(Duration::from_millis(300));
        let mut supervisor = ProcessSupervisor::new(spec);

        let started = Instant::now();
        let err = supervisor.start().unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.code(), "readiness_timeout");
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
        assert_eq!(supervisor.status(), ProcessStatus::NotStarted);
    }

    #[test]
    fn exit_during_warm_up_skips_readiness_polling() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let spec = shell("exit 3")
            .start_wait(Duration::from_millis(300))
            .ready_check(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });
        let mut supervisor = ProcessSupervisor::new(spec);

        let err = supervisor.start().unwrap_err();
        assert_eq!(err.code(), "startup");
        assert!(err.to_string().contains("exit code 3"), "{}", err);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.status(), ProcessStatus::NotStarted);
    }

    #[test]
    fn failing_process_without_readiness_check_is_a_startup_error() {
        let spec = shell("exit 1").start_wait(Duration::from_millis(200));
        let err = ProcessSupervisor::launch(spec).unwrap_err();
        assert_eq!(err.code(), "startup");
    }

    #[test]
    fn start_without_readiness_check_succeeds_after_warm_up() {
        let spec = shell("exec sleep 30").start_wait(Duration::from_millis(50));
        let mut supervisor = ProcessSupervisor::launch(spec).expect("launch");
        assert!(supervisor.is_running());
        assert!(supervisor.pid().is_some());

        supervisor.stop();
        assert_eq!(supervisor.status(), ProcessStatus::NotStarted);
        assert!(supervisor.pid().is_none());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut never_started = ProcessSupervisor::new(shell("exec sleep 30"));
        never_started.stop();
        never_started.stop();

        let mut supervisor = ProcessSupervisor::launch(shell("exec sleep 30")).expect("launch");
        supervisor.stop();
        supervisor.stop();
        assert_eq!(supervisor.status(), ProcessStatus::NotStarted);
    }

    #[test]
    fn stubborn_process_is_force_killed() {
        let spec = shell("trap '' TERM; exec sleep 30")
            .start_wait(Duration::from_millis(100))
            .terminate_timeout(Duration::from_millis(200));
        let mut supervisor = ProcessSupervisor::launch(spec).expect("launch");

        let started = Instant::now();
        supervisor.stop();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(supervisor.status(), ProcessStatus::NotStarted);
    }

    #[test]
    fn drop_stops_the_process() {
        let pid = {
            let supervisor = ProcessSupervisor::launch(shell("exec sleep 30")).expect("launch");
            supervisor.pid().expect("pid")
        };
        // SAFETY: signal 0 only checks for existence.
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        assert!(!alive, "pid {} still alive after drop", pid);
    }

    #[test]
    fn spawn_failure_is_reported() {
        let spec = ProcessSpec::new("/nonexistent/trailcam-test-binary").start_wait(Duration::ZERO);
        let err = ProcessSupervisor::launch(spec).unwrap_err();
        assert_eq!(err.code(), "spawn");
    }

    #[test]
    fn command_line_joins_program_and_args() {
        let spec = ProcessSpec::new("mediamtx").arg("mediamtx.yml");
        assert_eq!(spec.command_line(), "mediamtx mediamtx.yml");
        assert!(format!("{:?}", spec).contains("ready_check: false"));
    }
}
