//! camerad - headless camera capture
//!
//! This daemon:
//! 1. Loads the pipeline config (file, environment, CLI flags)
//! 2. Starts a capture session (image sequence + AVI recording)
//! 3. Polls the latest frame and reports status until Ctrl-C, `--seconds` or the
//!    device ends the session
//! 4. Stops the session and prints a summary of what was written

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use camera_pipeline::ui::{Ui, UiMode};
use camera_pipeline::{AviSummary, CaptureEngine, PipelineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture frames to an image sequence and an AVI file")]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "CAMERA_PIPELINE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Camera index, device node, or stub://name[?frames=N].
    #[arg(long)]
    device: Option<String>,

    /// Output directory for images and video.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Frame rate requested from the device and declared in the video.
    #[arg(long)]
    fps: Option<u32>,

    /// Stop after this many seconds (0 = until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    seconds: u64,

    /// Latest-frame poll interval in milliseconds.
    #[arg(long, default_value_t = 10)]
    poll_ms: u64,

    /// Status output.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,

    /// Append log records to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::load()?,
    };
    if let Some(device) = &args.device {
        config.device.device = device.clone();
    }
    if let Some(output) = &args.output {
        config.sinks.output_dir = output.clone();
    }
    if let Some(fps) = args.fps {
        config.device.target_fps = fps;
        config.sinks.video_fps = fps;
    }
    if args.log_file.is_some() {
        config.log_file = args.log_file.clone();
    }
    config.validate()?;

    init_logging(&config)?;

    let engine = CaptureEngine::new(&config)?;
    let device = config.device.resolved_device();

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    engine
        .start()
        .with_context(|| format!("start capture on {}", device))?;
    log::info!(
        "camerad capturing {} into {}",
        device,
        config.sinks.output_dir.display()
    );

    let ui = Ui::new(args.ui, std::io::stderr().is_terminal());
    let mut display = ui.session(&device);
    let poll = Duration::from_millis(args.poll_ms.max(1));
    let deadline = (args.seconds > 0).then(|| Instant::now() + Duration::from_secs(args.seconds));

    loop {
        match rx.recv_timeout(poll) {
            Ok(()) => {
                log::info!("shutdown signal received, stopping capture...");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let latest = engine.get_frame().map(|frame| frame.dimensions());
        display.update(&engine.stats(), latest);

        if !engine.is_running() {
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("capture duration reached, stopping capture...");
            break;
        }
    }

    engine.stop()?;
    let status = engine.status();
    let stats = engine.stats();
    display.finish(&status, &stats);

    println!("device:       {}", device);
    println!("status:       {:?}", status);
    println!("frames:       {}", stats.frames_captured);
    if let Some(fps) = stats.throughput {
        println!("throughput:   {:.2} fps", fps);
    }
    println!(
        "images:       {} written, {} failed",
        stats.sinks.images_written, stats.sinks.image_failures
    );
    match &stats.sinks.video_path {
        Some(path) => match AviSummary::read(path) {
            Ok(summary) => println!(
                "video:        {} ({}x{} @ {} fps, {} frames)",
                path.display(),
                summary.width,
                summary.height,
                summary.fps,
                summary.declared_frames
            ),
            Err(err) => println!("video:        {} (unreadable: {:#})", path.display(), err),
        },
        None => println!("video:        none"),
    }
    Ok(())
}

fn init_logging(config: &PipelineConfig) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = &config.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
