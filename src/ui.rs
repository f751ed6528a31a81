//! Terminal status for `camerad`: an indicatif spinner on a TTY, plain lines otherwise.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::engine::{EngineStatus, SessionStats};

const PLAIN_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    fn use_pretty(&self) -> bool {
        match self.mode {
            UiMode::Pretty => true,
            UiMode::Auto => self.is_tty,
            UiMode::Plain => false,
        }
    }

    /// Status line for one capture session.
    pub fn session(&self, device: &str) -> SessionDisplay {
        let spinner = if self.use_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {elapsed_precise} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("capturing from {device}…"));
            Some(spinner)
        } else {
            eprintln!("==> capturing from {}", device);
            None
        };
        SessionDisplay {
            device: device.to_string(),
            start: Instant::now(),
            last_plain: None,
            spinner,
        }
    }
}

pub struct SessionDisplay {
    device: String,
    start: Instant,
    last_plain: Option<Instant>,
    spinner: Option<ProgressBar>,
}

impl SessionDisplay {
    /// Refresh with the latest stats and the size of the most recent frame.
    pub fn update(&mut self, stats: &SessionStats, latest: Option<(u32, u32)>) {
        let line = status_line(stats, latest);
        match &self.spinner {
            Some(spinner) => spinner.set_message(line),
            None => {
                let due = self
                    .last_plain
                    .map_or(true, |last| last.elapsed() >= PLAIN_INTERVAL);
                if due {
                    eprintln!("    {}", line);
                    self.last_plain = Some(Instant::now());
                }
            }
        }
    }

    /// Final line for the session.
    pub fn finish(self, status: &EngineStatus, stats: &SessionStats) {
        let mark = match status {
            EngineStatus::Failed(_) => "✘",
            _ => "✔",
        };
        let message = format!(
            "{} {} {:?}: {} ({})",
            mark,
            self.device,
            status,
            status_line(stats, None),
            format_duration(self.start.elapsed())
        );
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub fn status_line(stats: &SessionStats, latest: Option<(u32, u32)>) -> String {
    let fps = stats
        .throughput
        .map_or_else(|| "-".to_string(), |fps| format!("{fps:.1}"));
    let mut line = format!(
        "{} frames, {} fps, {} images, {} video frames",
        stats.frames_captured, fps, stats.sinks.images_written, stats.sinks.video_frames
    );
    let failures = stats.sinks.image_failures + stats.sinks.video_failures;
    if failures > 0 {
        line.push_str(&format!(", {failures} write failures"));
    }
    if let Some((width, height)) = latest {
        line.push_str(&format!(", last {width}x{height}"));
    }
    line
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
