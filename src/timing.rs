//! Accumulating wall-clock timer for processing loops.

use std::time::{Duration, Instant};

/// Sums the wall time of many measured intervals.
///
/// ```
/// use trailcam::timing::Timer;
///
/// let mut timer = Timer::new();
/// let doubled = timer.time(|| 21 * 2);
/// assert_eq!(doubled, 42);
/// assert_eq!(timer.intervals(), 1);
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Timer {
    elapsed: Duration,
    intervals: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn intervals(&self) -> u64 {
        self.intervals
    }

    /// Measure until the returned guard is dropped.
    pub fn measure(&mut self) -> Measurement<'_> {
        Measurement {
            timer: self,
            start: Instant::now(),
        }
    }

    /// Measure one call of `f`.
    pub fn time<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let _measurement = self.measure();
        f()
    }

    pub fn record(&mut self, interval: Duration) {
        self.elapsed += interval;
        self.intervals += 1;
    }

    /// Clear the accumulated time, returning what it was. The interval count is kept.
    pub fn reset(&mut self) -> Duration {
        std::mem::take(&mut self.elapsed)
    }

    /// Intervals per second of measured time; zero before anything was measured.
    pub fn per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.intervals as f64 / secs
    }

    /// Mean interval length.
    pub fn per_interval(&self) -> Duration {
        match u32::try_from(self.intervals) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.elapsed / n,
            Err(_) => Duration::from_secs_f64(self.elapsed.as_secs_f64() / self.intervals as f64),
        }
    }

    /// One-line summary in the form the CLI prints after a run.
    pub fn summary(&self) -> String {
        format!(
            "Processed {} frames in {:.2} sec; {:.2}FPS",
            self.intervals,
            self.elapsed.as_secs_f64(),
            self.per_second()
        )
    }
}

/// Guard returned by `Timer::measure`.
pub struct Measurement<'a> {
    timer: &'a mut Timer,
    start: Instant,
}

impl Drop for Measurement<'_> {
    fn drop(&mut self) {
        self.timer.record(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_intervals() {
        let mut timer = Timer::new();
        timer.record(Duration::from_millis(200));
        timer.record(Duration::from_millis(300));
        assert_eq!(timer.intervals(), 2);
        assert_eq!(timer.elapsed(), Duration::from_millis(500));
        assert!((timer.per_second() - 4.0).abs() < 1e-9);
        assert_eq!(timer.per_interval(), Duration::from_millis(250));
    }

    #[test]
    fn guard_records_on_drop() {
        let mut timer = Timer::new();
        {
            let _m = timer.measure();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(timer.intervals(), 1);
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn reset_returns_previous_total() {
        let mut timer = Timer::new();
        timer.record(Duration::from_secs(1));
        assert_eq!(timer.reset(), Duration::from_secs(1));
        assert_eq!(timer.elapsed(), Duration::ZERO);
        assert_eq!(timer.per_second(), 0.0);
    }
}
