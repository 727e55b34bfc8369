//! trailcam - trail-camera video tooling
//!
//! Subcommands:
//! - `rescale`: resize and decimate a video file
//! - `motion`: write the background-subtraction motion mask of a video file
//! - `serve`: loop a file into a local RTSP relay until Ctrl-C
//! - `watch`: follow a live source and report motion on the freshest frames
//! - `perftest`: find the resolutions and rates that process faster than real time

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trailcam::config::TrailcamConfig;
use trailcam::handler::{DEFAULT_HISTORY, DEFAULT_KERNEL_SIZE, DEFAULT_THRESHOLD};
use trailcam::perftest::downscale_plan;
use trailcam::process::{loop_broadcast, rtsp_relay, BroadcastSettings, ProcessSupervisor};
use trailcam::ui::{FrameProgress, Ui, UiMode};
use trailcam::{
    Ffmpeg, FrameHandler, FramePipeReader, FramePipeWriter, FreshFrameGrabber, MotionMask,
    PixelFormat, Rescaler, Timer, Transcoder, VideoStats,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Progress display.
    #[arg(long, value_enum, default_value_t = UiMode::Auto, global = true)]
    ui: UiMode,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resize a video and reduce its frame rate.
    Rescale {
        input: PathBuf,
        output: PathBuf,
        /// Output width (defaults to the input's).
        #[arg(long)]
        width: Option<u32>,
        /// Output height (defaults to the input's).
        #[arg(long)]
        height: Option<u32>,
        /// Output frame rate (defaults to the input's).
        #[arg(long)]
        fps: Option<f64>,
    },
    /// Write the motion mask of a video. The first `history` frames only train the model.
    Motion {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        detector: DetectorArgs,
    },
    /// Serve a file as a looping RTSP stream until Ctrl-C.
    Serve {
        /// File to broadcast.
        #[arg(long)]
        input: PathBuf,
    },
    /// Follow a live source and log how much of each fresh frame is moving.
    Watch {
        /// Source URL; defaults to the local relay stream. `stub://` for a synthetic feed.
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        /// Report frames whose moving share exceeds this.
        #[arg(long, default_value_t = 0.01)]
        min_proportion: f64,
        /// Optionally record the masks.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Output frame rate for --output.
        #[arg(long, default_value_t = 10.0)]
        fps: f64,
        #[command(flatten)]
        detector: DetectorArgs,
    },
    /// Benchmark rescaling and motion detection over a ladder of resolutions and rates.
    Perftest {
        input: PathBuf,
        /// Report destination, `-` for stdout.
        #[arg(long, default_value = "-")]
        output: String,
        /// Directory for the rendered intermediate files.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct DetectorArgs {
    /// Frames in the background model.
    #[arg(long, default_value_t = DEFAULT_HISTORY)]
    history: u32,
    /// Luma difference that counts as motion.
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: u8,
    /// Despeckle kernel size; 0 disables.
    #[arg(long, default_value_t = DEFAULT_KERNEL_SIZE)]
    kernel_size: usize,
}

impl DetectorArgs {
    fn detector(&self) -> MotionMask {
        MotionMask::new(self.history, self.threshold, self.kernel_size)
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = TrailcamConfig::load()?;
    let ui = Ui::detect(cli.ui);
    let transcoder: Arc<dyn Transcoder> = Arc::new(Ffmpeg::new(&cfg.ffmpeg, &cfg.ffprobe));

    match cli.command {
        Command::Rescale {
            input,
            output,
            width,
            height,
            fps,
        } => {
            let timer = rescale(&cfg, &ui, &transcoder, &input, &output, width, height, fps)?;
            println!("{}", timer.summary());
            Ok(ExitCode::SUCCESS)
        }
        Command::Motion {
            input,
            output,
            detector,
        } => motion(&cfg, &ui, &transcoder, &input, &output, detector),
        Command::Serve { input } => {
            serve(&cfg, &ui, &input)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch {
            source,
            width,
            height,
            min_proportion,
            output,
            fps,
            detector,
        } => {
            let source = source.unwrap_or_else(|| cfg.relay.rtsp_url());
            let watch = Watch {
                source,
                width,
                height,
                min_proportion,
                output,
                fps,
                detector,
            };
            watch.run(&cfg, &transcoder)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Perftest {
            input,
            output,
            workdir,
        } => {
            perftest(&cfg, &ui, &transcoder, &input, &output, &workdir)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ----------------------------------------------------------------------------
// File conversion
// ----------------------------------------------------------------------------

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

fn probe(transcoder: &Arc<dyn Transcoder>, input: &Path) -> Result<VideoStats> {
    let stats = transcoder
        .probe(path_str(input)?)
        .with_context(|| format!("failed to probe {}", input.display()))?;
    log::info!(
        "{}: {}x{} @ {:.2} fps, {} frames",
        input.display(),
        stats.width,
        stats.height,
        stats.fps,
        stats.frame_count
    );
    Ok(stats)
}

/// Feed every frame of `reader` through `handler`, writing outputs from the `skip`-th frame on.
fn convert(
    reader: FramePipeReader,
    writer: &mut FramePipeWriter,
    handler: &mut dyn FrameHandler,
    timer: &mut Timer,
    progress: &FrameProgress,
    skip: u64,
) -> Result<()> {
    log::debug!("running {} handler", handler.name());
    let mut handled = 0u64;
    for frame in reader {
        let frame = frame?;
        handled += 1;
        let seq = frame.seq();
        let out = timer.time(|| handler.handle(frame));
        progress.inc();
        if let Some(out) = out {
            if past_warmup(seq, skip) {
                writer.write(&out)?;
            }
        }
    }
    writer.close()?;
    log::info!(
        "{}: {} frames in {:.2}s, {} written",
        handler.name(),
        handled,
        progress.elapsed().as_secs_f64(),
        writer.frames_written()
    );
    Ok(())
}

/// Whether zero-based frame `seq` is at or past the `skip`-th frame (counted from one).
fn past_warmup(seq: u64, skip: u64) -> bool {
    seq + 1 >= skip
}

#[allow(clippy::too_many_arguments)]
fn rescale(
    cfg: &TrailcamConfig,
    ui: &Ui,
    transcoder: &Arc<dyn Transcoder>,
    input: &Path,
    output: &Path,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
) -> Result<Timer> {
    let stats = probe(transcoder, input)?;
    let mut rescaler = Rescaler::new(&stats, width, height, fps)?;
    let reader = FramePipeReader::new(path_str(input)?, Arc::clone(transcoder))
        .with_dimensions(stats.width, stats.height)
        .with_format(stats.colourspace.pixel_format());
    let mut writer = FramePipeWriter::new(
        path_str(output)?,
        cfg.encode.settings(rescaler.fps()),
        Arc::clone(transcoder),
    );
    let mut timer = Timer::new();
    let progress = ui.frames(&format!("rescale {}", input.display()), stats.frame_count);
    convert(reader, &mut writer, &mut rescaler, &mut timer, &progress, 0)?;
    Ok(timer)
}

fn motion(
    cfg: &TrailcamConfig,
    ui: &Ui,
    transcoder: &Arc<dyn Transcoder>,
    input: &Path,
    output: &Path,
    detector: DetectorArgs,
) -> Result<ExitCode> {
    let stats = probe(transcoder, input)?;
    if stats.frame_count < detector.history as u64 {
        eprintln!("Must have input longer than history");
        return Ok(ExitCode::from(1));
    }
    let mut mask = detector.detector();
    let reader = FramePipeReader::new(path_str(input)?, Arc::clone(transcoder))
        .with_dimensions(stats.width, stats.height)
        .with_format(stats.colourspace.pixel_format());
    let mut writer = FramePipeWriter::new(
        path_str(output)?,
        cfg.encode.settings(stats.fps),
        Arc::clone(transcoder),
    );
    let mut timer = Timer::new();
    let progress = ui.frames(&format!("motion {}", input.display()), stats.frame_count);
    convert(
        reader,
        &mut writer,
        &mut mask,
        &mut timer,
        &progress,
        detector.history as u64,
    )?;
    drop(progress);
    println!("{}", timer.summary());
    Ok(ExitCode::SUCCESS)
}

// ----------------------------------------------------------------------------
// Live streams
// ----------------------------------------------------------------------------

fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .context("error setting Ctrl-C handler")?;
    Ok(flag)
}

fn serve(cfg: &TrailcamConfig, ui: &Ui, input: &Path) -> Result<()> {
    let shutdown = shutdown_flag()?;
    let url = cfg.relay.rtsp_url();

    let startup = ui.stage("start RTSP stream");
    let relay = ProcessSupervisor::launch(rtsp_relay(&cfg.relay, &cfg.supervisor))
        .context("failed to start RTSP relay")?;
    log::info!("relay running (pid {:?})", relay.pid());
    let broadcast = BroadcastSettings {
        ffmpeg: cfg.ffmpeg.clone(),
        input: input.to_path_buf(),
        url: url.clone(),
    };
    let mut broadcaster = ProcessSupervisor::launch(loop_broadcast(&broadcast, &cfg.supervisor))
        .context("failed to start broadcast")?;
    log::info!("stream up after {:.2}s", startup.elapsed().as_secs_f64());
    drop(startup);

    println!("RTSP stream ready at {}", url);
    while !shutdown.load(Ordering::SeqCst) {
        if !broadcaster.is_running() {
            return Err(anyhow!("broadcast exited: {}", broadcaster.status()));
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    log::info!("shutdown signal received, stopping stream...");
    // broadcaster first, then the relay it publishes into
    drop(broadcaster);
    drop(relay);
    println!("Cleanup complete");
    Ok(())
}

struct Watch {
    source: String,
    width: Option<u32>,
    height: Option<u32>,
    min_proportion: f64,
    output: Option<PathBuf>,
    fps: f64,
    detector: DetectorArgs,
}

impl Watch {
    fn run(self, cfg: &TrailcamConfig, transcoder: &Arc<dyn Transcoder>) -> Result<()> {
        let mut grabber_cfg = cfg.grabber.grabber_config();
        grabber_cfg.width = self.width;
        grabber_cfg.height = self.height;
        grabber_cfg.format = PixelFormat::Bgr24;

        let mut grabber = FreshFrameGrabber::new(self.source.clone(), grabber_cfg);
        grabber
            .open(transcoder.as_ref())
            .with_context(|| format!("failed to open {}", self.source))?;
        // Ctrl-C ends the frame sequence even while waiting on a stalled source.
        let cancel = grabber.cancel_handle();
        ctrlc::set_handler(move || cancel.cancel()).context("error setting Ctrl-C handler")?;
        let mut writer = match &self.output {
            Some(path) => Some(FramePipeWriter::new(
                path_str(path)?,
                cfg.encode.settings(self.fps),
                Arc::clone(transcoder),
            )),
            None => None,
        };

        let mut mask = self.detector.detector();
        let mut timer = Timer::new();
        log::info!("watching {} (Ctrl-C to stop)", self.source);
        for frame in grabber.frames() {
            let seq = frame.seq();
            let Some(out) = timer.time(|| mask.handle(frame)) else {
                continue;
            };
            if let Some(proportion) = mask.last_proportion() {
                if proportion > self.min_proportion {
                    log::info!("motion in frame {}: {:.2}%", seq, proportion * 100.0);
                }
            }
            if let Some(writer) = writer.as_mut() {
                writer.write(&out)?;
            }
        }

        let closed = grabber.close();
        if let Some(mut writer) = writer {
            writer.close()?;
        }
        closed?;
        println!("{}", timer.summary());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Benchmark
// ----------------------------------------------------------------------------

fn perftest(
    cfg: &TrailcamConfig,
    ui: &Ui,
    transcoder: &Arc<dyn Transcoder>,
    input: &Path,
    output: &str,
    workdir: &Path,
) -> Result<()> {
    let mut report: Box<dyn Write> = if output == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(File::create(output).with_context(|| format!("failed to create {}", output))?)
    };
    std::fs::create_dir_all(workdir)
        .with_context(|| format!("failed to create {}", workdir.display()))?;

    let stats = probe(transcoder, input)?;
    let plan = downscale_plan(&stats);
    log::info!("benchmarking {} operating points", plan.len());

    let mut rendered = Vec::with_capacity(plan.len());
    for step in &plan {
        let path = workdir.join(step.file_name("mp4"));
        writeln!(report, "{}", path.display())?;
        let timer = rescale(
            cfg,
            ui,
            transcoder,
            input,
            &path,
            Some(step.width),
            Some(step.height),
            Some(step.fps),
        )?;
        writeln!(report, "{}", timer.summary())?;
        rendered.push((*step, path));
    }

    let scratch = workdir.join("motion.mp4");
    for (step, path) in &rendered {
        let stats = probe(transcoder, path)?;
        let mut mask = MotionMask::default();
        let reader = FramePipeReader::new(path_str(path)?, Arc::clone(transcoder))
            .with_dimensions(stats.width, stats.height);
        let mut writer = FramePipeWriter::new(
            path_str(&scratch)?,
            cfg.encode.settings(stats.fps),
            Arc::clone(transcoder),
        );
        let mut timer = Timer::new();
        let progress = ui.frames(&format!("motion {}", path.display()), stats.frame_count);
        convert(reader, &mut writer, &mut mask, &mut timer, &progress, 0)?;
        let elapsed = timer.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            stats.duration_secs() / elapsed
        } else {
            0.0
        };
        writeln!(
            report,
            "Processed {}x{}@{:.2} in {:.2} sec; {:.2}x",
            step.width, step.height, step.fps, elapsed, speed
        )?;
    }
    report.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_releases_the_skip_th_frame() {
        // history 3: frames 0 and 1 are dropped, frame 2 is the third seen
        assert!(!past_warmup(0, 3));
        assert!(!past_warmup(1, 3));
        assert!(past_warmup(2, 3));
        assert!(past_warmup(0, 0));
    }

    #[test]
    fn cli_parses_motion_defaults() {
        let cli = Cli::try_parse_from(["trailcam", "motion", "in.mp4", "out.mp4"]).unwrap();
        match cli.command {
            Command::Motion { detector, .. } => {
                assert_eq!(detector.history, DEFAULT_HISTORY);
                assert_eq!(detector.threshold, DEFAULT_THRESHOLD);
                assert_eq!(detector.kernel_size, DEFAULT_KERNEL_SIZE);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
