//! Freshest-frame capture for live sources.
//!
//! A background thread grabs continuously from the capture handle so the source
//! never backs up. The consumer retrieves whatever was grabbed most recently;
//! units grabbed in between are dropped on purpose. For a live feed a stale frame
//! is worse than a missing one.
//!
//! Both sides share one mutex around the capture handle. The producer holds it
//! across the blocking grab, since the handle only supports serialized access.
//! A condvar wakes the consumer when a new unit is available, so no unit is
//! retrieved twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::capture::{Capture, PipeCapture, SyntheticCapture};
use crate::error::{MediaError, Result};
use crate::frame::{Frame, PixelFormat};
use crate::pipe::Transcoder;

const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_GRAB_PAUSE: Duration = Duration::from_millis(10);
const SYNTHETIC_WIDTH: u32 = 640;
const SYNTHETIC_HEIGHT: u32 = 480;
/// Upper bound on one consumer wait before re-checking the termination flag.
const CONSUMER_WAIT: Duration = Duration::from_millis(100);

/// Configuration for a `FreshFrameGrabber`.
#[derive(Clone, Debug, PartialEq)]
pub struct GrabberConfig {
    /// How long `close()` waits for the capture thread to stop.
    pub termination_timeout: Duration,
    /// Sleep between grabs, outside the lock, so the consumer can get in.
    pub grab_pause: Option<Duration>,
    /// Output geometry. Probed from the source when unset.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: PixelFormat,
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self {
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
            grab_pause: Some(DEFAULT_GRAB_PAUSE),
            width: None,
            height: None,
            format: PixelFormat::Bgr24,
        }
    }
}

impl GrabberConfig {
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

/// Lifecycle of a grabber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrabberState {
    Idle,
    Opening,
    Streaming,
    Closing,
    Closed,
    Failed,
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

struct CaptureSlot {
    capture: Option<Box<dyn Capture>>,
    /// A unit was grabbed since the last retrieve.
    fresh: bool,
    producer_done: bool,
}

struct GrabberShared {
    slot: Mutex<CaptureSlot>,
    grabbed: Condvar,
    terminate: AtomicBool,
}

impl GrabberShared {
    fn lock(&self) -> MutexGuard<'_, CaptureSlot> {
        // A panicking capture must not wedge the other side.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }
}

fn release_capture(slot: &mut CaptureSlot, source: &str) {
    if let Some(mut capture) = slot.capture.take() {
        capture.release();
        log::debug!("grabber for {} released its capture", source);
    }
}

// ----------------------------------------------------------------------------
// Grabber
// ----------------------------------------------------------------------------

/// Background-threaded capture exposing only the most recent frame.
pub struct FreshFrameGrabber {
    source: String,
    config: GrabberConfig,
    state: GrabberState,
    shared: Option<Arc<GrabberShared>>,
    worker: Option<JoinHandle<()>>,
    stopped: Option<mpsc::Receiver<()>>,
}

impl FreshFrameGrabber {
    pub fn new(source: impl Into<String>, config: GrabberConfig) -> Self {
        Self {
            source: source.into(),
            config,
            state: GrabberState::Idle,
            shared: None,
            worker: None,
            stopped: None,
        }
    }

    /// Start streaming from an already opened capture.
    pub fn from_capture(
        label: impl Into<String>,
        capture: Box<dyn Capture>,
        config: GrabberConfig,
    ) -> Result<Self> {
        let mut grabber = Self::new(label, config);
        grabber.state = GrabberState::Opening;
        if let Err(e) = grabber.start(capture) {
            grabber.state = GrabberState::Failed;
            return Err(e);
        }
        Ok(grabber)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> GrabberState {
        self.state
    }

    /// Open the source and start the capture thread.
    ///
    /// `stub://` sources get a synthetic capture; anything else is decoded by `transcoder`.
    pub fn open(&mut self, transcoder: &dyn Transcoder) -> Result<()> {
        if self.state != GrabberState::Idle {
            return Err(MediaError::stream_open(
                &self.source,
                format!("grabber is {:?}, not idle", self.state),
            ));
        }
        self.state = GrabberState::Opening;
        let opened = if self.source.starts_with("stub://") {
            let (width, height) = self
                .config
                .dimensions()
                .unwrap_or((SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT));
            log::info!("grabber: connected to {} (synthetic)", self.source);
            Ok(Box::new(SyntheticCapture::new(width, height)) as Box<dyn Capture>)
        } else {
            PipeCapture::open(
                &self.source,
                transcoder,
                self.config.dimensions(),
                self.config.format,
            )
            .map(|capture| Box::new(capture) as Box<dyn Capture>)
        };
        let result = opened.and_then(|capture| self.start(capture));
        if let Err(e) = &result {
            log::warn!("grabber failed to open {}: {}", self.source, e);
            self.state = GrabberState::Failed;
        }
        result
    }

    fn start(&mut self, capture: Box<dyn Capture>) -> Result<()> {
        let shared = Arc::new(GrabberShared {
            slot: Mutex::new(CaptureSlot {
                capture: Some(capture),
                fresh: false,
                producer_done: false,
            }),
            grabbed: Condvar::new(),
            terminate: AtomicBool::new(false),
        });
        let (done_tx, done_rx) = mpsc::channel();
        let producer_shared = Arc::clone(&shared);
        let pause = self.config.grab_pause;
        let source = self.source.clone();
        let worker = thread::Builder::new()
            .name("frame-grabber".to_string())
            .spawn(move || run_producer(producer_shared, pause, source, done_tx))
            .map_err(|e| MediaError::stream_open(&self.source, format!("cannot start capture thread: {}", e)))?;
        self.shared = Some(shared);
        self.worker = Some(worker);
        self.stopped = Some(done_rx);
        self.state = GrabberState::Streaming;
        Ok(())
    }

    /// Lazy, unbounded sequence of the freshest frames.
    ///
    /// Ends when the source ends, a retrieve fails, or the grabber is closed.
    pub fn frames(&self) -> FreshFrames {
        FreshFrames {
            shared: self.shared.clone(),
            source: self.source.clone(),
        }
    }

    /// Handle that ends the frame sequence from another thread, such as a signal handler.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stop the capture thread and release the capture handle.
    ///
    /// Waits at most `termination_timeout`. On timeout the thread is abandoned,
    /// `CloseTimeout` is returned, and the handle is released as soon as the
    /// thread's current grab returns.
    pub fn close(&mut self) -> Result<()> {
        let Some(shared) = self.shared.take() else {
            if self.state != GrabberState::Failed {
                self.state = GrabberState::Closed;
            }
            return Ok(());
        };
        self.state = GrabberState::Closing;
        shared.terminate.store(true, Ordering::Release);
        shared.grabbed.notify_all();

        let timeout = self.config.termination_timeout;
        let stopped = match self.stopped.take() {
            Some(rx) => match rx.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            },
            None => true,
        };
        let worker = self.worker.take();
        if stopped {
            if let Some(worker) = worker {
                if worker.join().is_err() {
                    log::warn!("capture thread for {} panicked", self.source);
                }
            }
        } else {
            log::warn!(
                "capture thread for {} did not stop within {:?}; detaching",
                self.source,
                timeout
            );
        }

        match shared.slot.try_lock() {
            Ok(mut slot) => release_capture(&mut slot, &self.source),
            Err(TryLockError::Poisoned(poisoned)) => {
                release_capture(&mut poisoned.into_inner(), &self.source)
            }
            Err(TryLockError::WouldBlock) => {
                log::warn!("capture for {} still busy; release deferred", self.source)
            }
        }
        self.state = GrabberState::Closed;

        if !stopped {
            return Err(MediaError::CloseTimeout {
                source_id: self.source.clone(),
                timeout,
            });
        }
        log::info!("grabber for {} closed", self.source);
        Ok(())
    }
}

/// Requests termination without waiting; `close()` still has to run.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Option<Arc<GrabberShared>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if let Some(shared) = &self.shared {
            shared.terminate.store(true, Ordering::Release);
            shared.grabbed.notify_all();
        }
    }
}

impl Drop for FreshFrameGrabber {
    fn drop(&mut self) {
        if self.shared.is_some() {
            if let Err(e) = self.close() {
                log::warn!("{}", e);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Producer
// ----------------------------------------------------------------------------

/// Marks the producer finished on every exit path, including a panicking grab.
struct ProducerExit {
    shared: Arc<GrabberShared>,
    source: String,
    done: Sender<()>,
}

impl Drop for ProducerExit {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.lock();
            slot.producer_done = true;
            if self.shared.terminating() {
                release_capture(&mut slot, &self.source);
            }
        }
        self.shared.grabbed.notify_all();
        let _ = self.done.send(());
    }
}

fn run_producer(
    shared: Arc<GrabberShared>,
    pause: Option<Duration>,
    source: String,
    done: Sender<()>,
) {
    let exit = ProducerExit {
        shared,
        source,
        done,
    };
    let shared = &exit.shared;
    let mut grabs: u64 = 0;
    loop {
        if shared.terminating() {
            break;
        }
        {
            let mut slot = shared.lock();
            let Some(capture) = slot.capture.as_mut() else {
                break;
            };
            match capture.grab() {
                Ok(true) => slot.fresh = true,
                Ok(false) => {
                    log::info!("{} ended after {} grabs", exit.source, grabs);
                    break;
                }
                Err(e) => {
                    log::warn!("grab from {} failed: {}", exit.source, e);
                    break;
                }
            }
        }
        grabs += 1;
        shared.grabbed.notify_all();
        if let Some(pause) = pause {
            thread::sleep(pause);
        }
    }
}

// ----------------------------------------------------------------------------
// Consumer
// ----------------------------------------------------------------------------

/// Iterator over the freshest frames of a `FreshFrameGrabber`.
pub struct FreshFrames {
    shared: Option<Arc<GrabberShared>>,
    source: String,
}

impl Iterator for FreshFrames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let shared = Arc::clone(self.shared.as_ref()?);
        let mut slot = shared.lock();
        loop {
            if shared.terminating() || (!slot.fresh && slot.producer_done) {
                self.shared = None;
                return None;
            }
            if slot.fresh {
                break;
            }
            slot = shared
                .grabbed
                .wait_timeout(slot, CONSUMER_WAIT)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        slot.fresh = false;
        let retrieved = slot.capture.as_mut().map(|capture| capture.retrieve());
        drop(slot);
        match retrieved {
            Some(Ok(frame)) => Some(frame),
            Some(Err(e)) => {
                log::warn!("retrieve from {} failed: {}", self.source, e);
                self.shared = None;
                None
            }
            None => {
                self.shared = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Capture whose grabs block far longer than any sensible close timeout.
    struct SlowCapture {
        delay: Duration,
    }

    impl Capture for SlowCapture {
        fn grab(&mut self) -> Result<bool> {
            thread::sleep(self.delay);
            Ok(true)
        }

        fn retrieve(&mut self) -> Result<Frame> {
            Ok(Frame::filled(2, 2, PixelFormat::Bgr24, 0, 0))
        }

        fn release(&mut self) {}
    }

    /// Capture that fails at either step.
    struct BrokenCapture {
        grab_fails: bool,
        released: Arc<AtomicBool>,
    }

    impl Capture for BrokenCapture {
        fn grab(&mut self) -> Result<bool> {
            if self.grab_fails {
                return Err(MediaError::InvalidFrame("device unplugged".to_string()));
            }
            thread::sleep(Duration::from_millis(1));
            Ok(true)
        }

        fn retrieve(&mut self) -> Result<Frame> {
            Err(MediaError::InvalidFrame("corrupt unit".to_string()))
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn fast_config() -> GrabberConfig {
        GrabberConfig {
            termination_timeout: Duration::from_secs(2),
            grab_pause: Some(Duration::from_millis(1)),
            ..GrabberConfig::default()
        }
    }

    #[test]
    fn slow_consumer_sees_fresh_frames_in_order() {
        let capture = SyntheticCapture::new(16, 8)
            .with_limit(100)
            .with_grab_delay(Duration::from_millis(2));
        let mut grabber =
            FreshFrameGrabber::from_capture("stub://ordered", Box::new(capture), fast_config()).unwrap();
        assert_eq!(grabber.state(), GrabberState::Streaming);

        let mut seen = Vec::new();
        for frame in grabber.frames() {
            seen.push(frame.seq());
            thread::sleep(Duration::from_millis(15));
        }
        assert!(!seen.is_empty());
        assert!(seen.len() < 100, "slow consumer should skip units");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);
        assert!(*seen.last().unwrap() < 100);

        grabber.close().unwrap();
        assert_eq!(grabber.state(), GrabberState::Closed);
    }

    #[test]
    fn close_is_bounded_against_stuck_producer() {
        let config = GrabberConfig {
            termination_timeout: Duration::from_millis(100),
            grab_pause: None,
            ..GrabberConfig::default()
        };
        let capture = SlowCapture {
            delay: Duration::from_secs(2),
        };
        let mut grabber =
            FreshFrameGrabber::from_capture("stub://slow", Box::new(capture), config).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        let err = grabber.close().unwrap_err();
        assert_eq!(err.code(), "close_timeout");
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(grabber.state(), GrabberState::Closed);
    }

    #[test]
    fn stub_source_opens_synthetic_capture() {
        let config = GrabberConfig {
            width: Some(8),
            height: Some(4),
            ..fast_config()
        };
        let mut grabber = FreshFrameGrabber::new("stub://camera", config);
        assert_eq!(grabber.state(), GrabberState::Idle);
        grabber.open(&crate::pipe::Ffmpeg::default()).unwrap();

        let frame = grabber.frames().next().expect("frame");
        assert_eq!((frame.width(), frame.height()), (8, 4));
        grabber.close().unwrap();
        assert!(grabber.frames().next().is_none());
    }

    #[test]
    fn cancel_ends_frame_sequence() {
        let capture = SyntheticCapture::new(4, 4).with_grab_delay(Duration::from_millis(5));
        let mut grabber =
            FreshFrameGrabber::from_capture("stub://cancel", Box::new(capture), fast_config()).unwrap();
        let cancel = grabber.cancel_handle();
        let mut frames = grabber.frames();
        assert!(frames.next().is_some());
        cancel.cancel();
        assert!(frames.next().is_none());
        grabber.close().unwrap();
    }

    fn broken(grab_fails: bool) -> (FreshFrameGrabber, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let capture = BrokenCapture {
            grab_fails,
            released: Arc::clone(&released),
        };
        let grabber =
            FreshFrameGrabber::from_capture("stub://broken", Box::new(capture), fast_config()).unwrap();
        (grabber, released)
    }

    #[test]
    fn failed_grab_ends_frame_sequence() {
        let (mut grabber, released) = broken(true);
        assert_eq!(grabber.frames().count(), 0);
        grabber.close().unwrap();
        assert_eq!(grabber.state(), GrabberState::Closed);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_retrieve_ends_frame_sequence() {
        let (mut grabber, released) = broken(false);
        assert_eq!(grabber.frames().count(), 0);
        grabber.close().unwrap();
        assert_eq!(grabber.state(), GrabberState::Closed);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn unopenable_source_fails() {
        let config = GrabberConfig {
            width: Some(8),
            height: Some(8),
            ..GrabberConfig::default()
        };
        let ffmpeg = crate::pipe::Ffmpeg::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let mut grabber = FreshFrameGrabber::new("rtsp://127.0.0.1:1/none", config);
        let err = grabber.open(&ffmpeg).unwrap_err();
        assert_eq!(err.code(), "stream_open");
        assert_eq!(grabber.state(), GrabberState::Failed);
        assert!(grabber.open(&ffmpeg).is_err());
        grabber.close().unwrap();
        assert_eq!(grabber.state(), GrabberState::Failed);
    }
}
