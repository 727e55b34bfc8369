//! Throughput benchmarking helpers.
//!
//! The benchmark answers one question: at which resolution and frame rate can a
//! pipeline keep up with the source in real time. `downscale_plan` lists the
//! candidate operating points; the CLI renders each one and times the handlers.

use std::io;
use std::process::Command;
use std::time::{Duration, Instant};

use crate::error::{MediaError, Result};
use crate::stats::VideoStats;

/// Halve resolution until the frame is at most this many pixels high.
pub const MAX_PLAN_HEIGHT: u32 = 300;
/// Halve the frame rate until it is at most this.
pub const MIN_PLAN_FPS: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformanceMetrics {
    pub wall: Duration,
}

/// Run an external program to completion and report its wall time.
pub fn run_program_and_measure<S: AsRef<str>>(args: &[S]) -> Result<PerformanceMetrics> {
    let Some((program, rest)) = args.split_first() else {
        return Err(MediaError::Spawn {
            program: String::new(),
            cause: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
        });
    };
    let program = program.as_ref();
    let started = Instant::now();
    let status = Command::new(program)
        .args(rest.iter().map(|a| a.as_ref()))
        .status()
        .map_err(|cause| MediaError::Spawn {
            program: program.to_string(),
            cause,
        })?;
    let wall = started.elapsed();
    if !status.success() {
        return Err(MediaError::ProcessFailed {
            program: program.to_string(),
            status,
        });
    }
    Ok(PerformanceMetrics { wall })
}

/// One operating point of the benchmark.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleStep {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl ScaleStep {
    /// File name used for the rendered step, e.g. `960x540f15.00.mp4`.
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}x{}f{:.2}.{}", self.width, self.height, self.fps, extension)
    }
}

/// Candidate operating points, source first.
///
/// Resolution is halved until the height is at most `MAX_PLAN_HEIGHT`. Then the
/// frame rate is halved (rounded down), and every resolution is repeated at
/// each new rate, until the rate is at most `MIN_PLAN_FPS`.
pub fn downscale_plan(stats: &VideoStats) -> Vec<ScaleStep> {
    let mut resolutions = vec![(stats.width, stats.height)];
    while let Some(&(w, h)) = resolutions.last() {
        if h <= MAX_PLAN_HEIGHT || w < 2 || h < 2 {
            break;
        }
        resolutions.push((w / 2, h / 2));
    }

    let mut plan: Vec<ScaleStep> = resolutions
        .iter()
        .map(|&(width, height)| ScaleStep {
            width,
            height,
            fps: stats.fps,
        })
        .collect();
    let mut fps = stats.fps;
    while fps > MIN_PLAN_FPS {
        fps = (fps / 2.0).floor();
        plan.extend(resolutions.iter().map(|&(width, height)| ScaleStep {
            width,
            height,
            fps,
        }));
    }
    plan
}
