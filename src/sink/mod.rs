//! Persistence sinks for captured frames.
//!
//! A `FrameSinkSet` lives for exactly one capture session and owns:
//! - an image-sequence writer (one file per frame)
//! - a container-video writer, opened lazily from the session's first frame
//!
//! Per-frame write failures are logged and counted; they never end a session. Only a
//! video writer that cannot be opened is session-fatal.

pub mod avi;
#[cfg(feature = "record-gstreamer")]
pub mod gst;
pub mod image_seq;
pub mod video;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::frame::Frame;

pub use avi::{AviMjpegWriter, AviSummary};
pub use image_seq::ImageSequenceWriter;
pub use video::{VideoEncoder, VideoSink, VideoSpec};

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// Numbered alternatives tried before giving up on a taken file name.
pub(crate) const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Output locations and encodings for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkConfig {
    /// Directory receiving image and video files. Created if absent.
    pub output_dir: PathBuf,
    /// Image file extension (`jpg`, `jpeg`, `png`).
    pub image_extension: String,
    /// Video container extension (`avi`).
    pub container_extension: String,
    /// Video codec fourcc (`MJPG`; `XVID` with `record-gstreamer`).
    pub codec: String,
    /// Frame rate declared in the video container.
    pub video_fps: u32,
    /// JPEG quality (1..=100) for images and MJPEG frames.
    pub jpeg_quality: u8,
    /// chrono format string for file name timestamps.
    pub timestamp_format: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("frames"),
            image_extension: "jpg".to_string(),
            container_extension: "avi".to_string(),
            codec: "MJPG".to_string(),
            video_fps: 30,
            jpeg_quality: 90,
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}

impl SinkConfig {
    /// `video_<session-start-timestamp>.<container-ext>` inside the output directory.
    pub fn video_path(&self, session_start: &DateTime<Local>) -> Result<PathBuf> {
        let stamp = format_timestamp(session_start, &self.timestamp_format)?;
        Ok(self
            .output_dir
            .join(format!("video_{}.{}", stamp, self.container_extension)))
    }
}

/// Per-session sink counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub images_written: u64,
    pub image_failures: u64,
    pub video_frames: u64,
    pub video_failures: u64,
    /// Set once the video file has been opened.
    pub video_path: Option<PathBuf>,
}

/// Both sinks of one capture session.
pub struct FrameSinkSet {
    images: ImageSequenceWriter,
    video: VideoSink,
    stats: SinkStats,
}

impl FrameSinkSet {
    /// Prepare the sinks for a session started at `session_start`. No file is created
    /// until the first frame arrives.
    pub fn new(config: &SinkConfig, session_start: DateTime<Local>) -> Result<Self> {
        ensure_output_dir(&config.output_dir)?;
        let images = ImageSequenceWriter::new(
            &config.output_dir,
            &config.image_extension,
            &config.timestamp_format,
            config.jpeg_quality,
        )?;
        let video = VideoSink::new(
            config.video_path(&session_start)?,
            config.video_fps,
            &config.codec,
            config.jpeg_quality,
        );
        Ok(Self {
            images,
            video,
            stats: SinkStats::default(),
        })
    }

    /// Write `frame` as image number `index`. Returns whether the file was written.
    pub fn write_image(&mut self, frame: &Frame, index: u64) -> bool {
        match self.images.write(frame, index) {
            Ok(path) => {
                self.stats.images_written += 1;
                log::debug!("FrameSinkSet: saved frame {:04} to {}", index, path.display());
                true
            }
            Err(err) => {
                self.stats.image_failures += 1;
                log::warn!("FrameSinkSet: failed to save frame {:04}: {:#}", index, err);
                false
            }
        }
    }

    /// Append `frame` to the session video, opening it on the first call.
    ///
    /// Returns an error only when the video file cannot be opened; append failures are
    /// counted and logged.
    pub fn write_video_frame(&mut self, frame: &Frame) -> Result<()> {
        if !self.video.is_open() {
            self.video
                .ensure_open(frame)
                .with_context(|| format!("open video {}", self.video.path().display()))?;
            self.stats.video_path = Some(self.video.path().to_path_buf());
        }
        match self.video.append(frame) {
            Ok(()) => self.stats.video_frames += 1,
            Err(err) => {
                self.stats.video_failures += 1;
                log::warn!(
                    "FrameSinkSet: failed to append frame {} to {}: {:#}",
                    frame.sequence,
                    self.video.path().display(),
                    err
                );
            }
        }
        Ok(())
    }

    /// Finalize the video file. Safe to call repeatedly and when nothing was opened.
    pub fn close(&mut self) {
        if let Err(err) = self.video.close() {
            self.stats.video_failures += 1;
            log::error!(
                "FrameSinkSet: failed to finalize video {}: {:#}",
                self.video.path().display(),
                err
            );
        }
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    pub fn video_dimensions(&self) -> Option<(u32, u32)> {
        self.video.dimensions()
    }
}

impl Drop for FrameSinkSet {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn ensure_output_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("create output directory {}", dir.display()))
}

pub(crate) fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(
            frame.pixels(),
            frame.width,
            frame.height,
            frame.layout.color_type(),
        )
        .context("encode frame as JPEG")?;
    Ok(out)
}

/// `name.ext` for attempt 0, `name_<attempt>.ext` afterwards.
pub(crate) fn numbered_path(path: &Path, attempt: u32) -> PathBuf {
    if attempt == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, attempt, ext.to_string_lossy()),
        None => format!("{}_{}", stem, attempt),
    };
    path.with_file_name(name)
}

/// Whether `err` comes from creating a file that already exists.
pub(crate) fn is_already_exists(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::AlreadyExists)
    })
}

/// Format `at` for use in a file name. Fails on an invalid format string or a result
/// that would escape the output directory.
pub fn format_timestamp(at: &DateTime<Local>, format: &str) -> Result<String> {
    let mut out = String::new();
    write!(out, "{}", at.format(format))
        .map_err(|_| anyhow!("invalid timestamp format '{}'", format))?;
    if out.is_empty() || out.contains(&['/', '\\'][..]) {
        return Err(anyhow!(
            "timestamp format '{}' does not produce a file name component",
            format
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;
    use chrono::TimeZone;

    fn config(dir: &Path) -> SinkConfig {
        SinkConfig {
            output_dir: dir.to_path_buf(),
            ..SinkConfig::default()
        }
    }

    fn frame(width: u32, height: u32, sequence: u64) -> Frame {
        let len = (width * height * 3) as usize;
        Frame::new(vec![sequence as u8; len], width, height, PixelLayout::Rgb24, sequence)
            .unwrap()
    }

    fn count_files(dir: &Path, prefix: &str) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
            .count()
    }

    #[test]
    fn video_name_uses_session_start() -> Result<()> {
        let start = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let cfg = SinkConfig {
            timestamp_format: "%Y%m%d_%H%M%S".to_string(),
            ..config(Path::new("out"))
        };
        assert_eq!(
            cfg.video_path(&start)?,
            Path::new("out").join("video_20240102_030405.avi")
        );
        Ok(())
    }

    #[test]
    fn numbered_paths_keep_extension() {
        let base = Path::new("out").join("video_20240102.avi");
        assert_eq!(numbered_path(&base, 0), base);
        assert_eq!(
            numbered_path(&base, 2),
            Path::new("out").join("video_20240102_2.avi")
        );
    }

    #[test]
    fn already_exists_is_found_through_context() {
        let err = anyhow::Error::new(io::Error::from(io::ErrorKind::AlreadyExists))
            .context("create video file");
        assert!(is_already_exists(&err));
        assert!(!is_already_exists(&anyhow!("disk full")));
    }

    #[test]
    fn invalid_timestamp_formats_are_errors() {
        let now = Local::now();
        assert!(format_timestamp(&now, "%Q").is_err());
        assert!(format_timestamp(&now, "%Y/%m").is_err());
        assert!(format_timestamp(&now, "").is_err());
    }

    #[test]
    fn creates_missing_output_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("a").join("b");
        let _sinks = FrameSinkSet::new(&config(&nested), Local::now())?;
        assert!(nested.is_dir());
        Ok(())
    }

    #[test]
    fn video_opens_on_first_frame_with_its_dimensions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sinks = FrameSinkSet::new(&config(dir.path()), Local::now())?;
        assert_eq!(count_files(dir.path(), "video_"), 0);

        for sequence in 1..=3 {
            let frame = frame(24, 12, sequence);
            assert!(sinks.write_image(&frame, sequence - 1));
            sinks.write_video_frame(&frame)?;
        }
        assert_eq!(sinks.video_dimensions(), Some((24, 12)));
        sinks.close();

        let stats = sinks.stats().clone();
        assert_eq!(stats.images_written, 3);
        assert_eq!(stats.video_frames, 3);
        let summary = AviSummary::read(stats.video_path.as_deref().unwrap())?;
        assert_eq!((summary.width, summary.height), (24, 12));
        assert_eq!(summary.declared_frames, 3);
        assert_eq!(count_files(dir.path(), "frame_"), 3);
        Ok(())
    }

    #[test]
    fn mismatched_frame_is_counted_not_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sinks = FrameSinkSet::new(&config(dir.path()), Local::now())?;
        sinks.write_video_frame(&frame(8, 8, 1))?;
        sinks.write_video_frame(&frame(16, 8, 2))?;
        sinks.write_video_frame(&frame(8, 8, 3))?;
        assert_eq!(sinks.stats().video_frames, 2);
        assert_eq!(sinks.stats().video_failures, 1);
        Ok(())
    }

    #[test]
    fn close_without_frames_creates_no_video() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sinks = FrameSinkSet::new(&config(dir.path()), Local::now())?;
        sinks.close();
        sinks.close();
        assert_eq!(count_files(dir.path(), "video_"), 0);
        assert_eq!(sinks.stats().video_path, None);
        Ok(())
    }

    #[test]
    fn failed_image_write_is_counted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("out");
        let mut sinks = FrameSinkSet::new(&config(&out), Local::now())?;
        fs::remove_dir_all(&out)?;

        assert!(!sinks.write_image(&frame(8, 8, 1), 0));
        assert_eq!(sinks.stats().image_failures, 1);
        Ok(())
    }

    #[test]
    fn unopenable_video_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = SinkConfig {
            codec: "ZZZZ".to_string(),
            ..config(dir.path())
        };
        let mut sinks = FrameSinkSet::new(&cfg, Local::now())?;
        assert!(sinks.write_video_frame(&frame(8, 8, 1)).is_err());
        assert_eq!(sinks.stats().video_path, None);
        Ok(())
    }
}
