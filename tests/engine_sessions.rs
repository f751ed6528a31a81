use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use camera_pipeline::{
    AviSummary, CaptureEngine, CaptureError, DeviceConfig, DeviceOpener, EngineStatus, Frame,
    FrameSource, PixelLayout, SinkConfig, SourceStats, StopReason,
};

// ---- helpers ----

fn sinks(dir: &Path) -> SinkConfig {
    SinkConfig {
        output_dir: dir.to_path_buf(),
        ..SinkConfig::default()
    }
}

fn stub(device: &str, fps: u32) -> DeviceConfig {
    DeviceConfig {
        device: device.to_string(),
        target_fps: fps,
        width: 32,
        height: 24,
    }
}

fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read output dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix))
        })
        .collect();
    files.sort();
    files
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn rgb_frame(sequence: u64) -> Frame {
    Frame::new(vec![sequence as u8; 16 * 8 * 3], 16, 8, PixelLayout::Rgb24, sequence)
        .expect("frame")
}

/// Device fed by the test through a channel. Dropping the sender is end-of-stream.
struct ChannelOpener {
    rx: Mutex<Option<Receiver<Result<Frame, String>>>>,
}

impl ChannelOpener {
    fn new() -> (Self, Sender<Result<Frame, String>>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl DeviceOpener for ChannelOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| anyhow!("lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("channel device already consumed"))?;
        Ok(Box::new(ChannelSource { rx, frames: 0 }))
    }

    fn device_id(&self) -> String {
        "channel://test".to_string()
    }
}

struct ChannelSource {
    rx: Receiver<Result<Frame, String>>,
    frames: u64,
}

impl FrameSource for ChannelSource {
    fn describe(&self) -> String {
        "channel://test".to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.rx.recv() {
            Ok(Ok(frame)) => {
                self.frames += 1;
                Ok(Some(frame))
            }
            Ok(Err(reason)) => Err(anyhow!(reason)),
            Err(_) => Ok(None),
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames,
            device: self.describe(),
        }
    }
}

/// Synthetic device that, like a real camera, can only be held by one session.
#[derive(Clone)]
struct ExclusiveOpener {
    inner: DeviceConfig,
    in_use: Arc<AtomicBool>,
}

impl ExclusiveOpener {
    fn new(inner: DeviceConfig) -> Self {
        Self {
            inner,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl DeviceOpener for ExclusiveOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("device busy"));
        }
        match self.inner.open() {
            Ok(source) => Ok(Box::new(ExclusiveSource {
                source,
                in_use: Arc::clone(&self.in_use),
            })),
            Err(err) => {
                self.in_use.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn device_id(&self) -> String {
        self.inner.device_id()
    }
}

struct ExclusiveSource {
    source: Box<dyn FrameSource>,
    in_use: Arc<AtomicBool>,
}

impl FrameSource for ExclusiveSource {
    fn describe(&self) -> String {
        self.source.describe()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.source.next_frame()
    }

    fn stats(&self) -> SourceStats {
        self.source.stats()
    }
}

impl Drop for ExclusiveSource {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::SeqCst);
    }
}

// ---- sessions ----

#[test]
fn finite_device_writes_every_frame_then_goes_idle() -> Result<()> {
    let dir = TempDir::new()?;
    let engine =
        CaptureEngine::with_opener(stub("stub://bench?frames=5", 100), sinks(dir.path()))?;
    engine.start()?;
    wait_for("end of stream", || !engine.is_running());

    assert_eq!(engine.status(), EngineStatus::Stopped(StopReason::EndOfStream));
    let images = files_with_prefix(dir.path(), "frame_");
    assert_eq!(images.len(), 5);
    for (index, path) in images.iter().enumerate() {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(&format!("_{:04}.jpg", index)), "{name}");
    }

    let videos = files_with_prefix(dir.path(), "video_");
    assert_eq!(videos.len(), 1);
    let summary = AviSummary::read(&videos[0])?;
    assert_eq!(summary.declared_frames, 5);
    assert_eq!(summary.frame_chunks, 5);
    assert_eq!(summary.index_entries, 5);
    assert_eq!((summary.width, summary.height), (32, 24));
    assert_eq!(engine.stats().frames_captured, 5);
    Ok(())
}

#[test]
fn stop_right_after_start_leaves_no_files() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = CaptureEngine::with_opener(stub("stub://slow", 10), sinks(dir.path()))?;
    engine.start()?;
    engine.stop()?;

    assert!(!engine.is_running());
    assert_eq!(engine.status(), EngineStatus::Stopped(StopReason::Requested));
    assert!(files_with_prefix(dir.path(), "frame_").is_empty());
    assert!(files_with_prefix(dir.path(), "video_").is_empty());
    assert!(engine.get_frame().is_none());
    Ok(())
}

#[test]
fn stopped_session_releases_device_for_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let opener = ExclusiveOpener::new(stub("stub://usb", 100));
    let in_use = Arc::clone(&opener.in_use);
    let engine = CaptureEngine::with_opener(opener, sinks(dir.path()))?;

    engine.start()?;
    wait_for("first session frames", || engine.stats().frames_captured >= 2);
    engine.stop()?;
    assert!(!in_use.load(Ordering::SeqCst));

    engine.start()?;
    wait_for("second session frames", || engine.stats().frames_captured >= 2);
    engine.stop()?;

    assert_eq!(files_with_prefix(dir.path(), "video_").len(), 2);
    for video in files_with_prefix(dir.path(), "video_") {
        assert!(AviSummary::read(&video)?.declared_frames >= 2);
    }
    Ok(())
}

#[test]
fn busy_device_fails_start_and_engine_stays_idle() -> Result<()> {
    let dir = TempDir::new()?;
    let opener = ExclusiveOpener::new(stub("stub://held", 100));
    opener.in_use.store(true, Ordering::SeqCst);
    let engine = CaptureEngine::with_opener(opener, sinks(dir.path()))?;

    let err = engine.start().unwrap_err();
    assert!(matches!(err, CaptureError::DeviceUnavailable { .. }), "{err:?}");
    assert_eq!(engine.status(), EngineStatus::Idle);
    assert!(!engine.is_running());
    assert!(fs::read_dir(dir.path())?.next().is_none());
    engine.stop()?;
    Ok(())
}

#[test]
fn second_start_while_running_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = CaptureEngine::with_opener(stub("stub://busy", 100), sinks(dir.path()))?;
    engine.start()?;
    assert!(matches!(engine.start(), Err(CaptureError::AlreadyRunning)));
    assert!(engine.is_running());
    engine.stop()?;
    Ok(())
}

#[test]
fn get_frame_returns_latest_published_frame() -> Result<()> {
    let dir = TempDir::new()?;
    let (opener, feed) = ChannelOpener::new();
    let engine = CaptureEngine::with_opener(opener, sinks(dir.path()))?;
    assert!(engine.get_frame().is_none());

    engine.start()?;
    assert!(engine.get_frame().is_none());

    for sequence in 1..=3 {
        feed.send(Ok(rgb_frame(sequence)))?;
    }
    wait_for("three frames", || engine.stats().frames_captured == 3);

    let latest = engine.get_frame().expect("latest frame");
    assert_eq!(latest.sequence, 3);
    assert_eq!(latest.dimensions(), (16, 8));
    // Repeated reads without a new frame return the same frame.
    assert_eq!(engine.get_frame().map(|frame| frame.sequence), Some(3));

    drop(feed);
    wait_for("end of stream", || !engine.is_running());
    assert!(engine.get_frame().is_none());
    Ok(())
}

#[test]
fn device_read_failure_ends_session_as_failed() -> Result<()> {
    let dir = TempDir::new()?;
    let (opener, feed) = ChannelOpener::new();
    let engine = CaptureEngine::with_opener(opener, sinks(dir.path()))?;
    engine.start()?;

    feed.send(Ok(rgb_frame(1)))?;
    feed.send(Ok(rgb_frame(2)))?;
    feed.send(Err("camera unplugged".to_string()))?;
    wait_for("read failure", || !engine.is_running());

    match engine.status() {
        EngineStatus::Failed(reason) => assert!(reason.contains("camera unplugged"), "{reason}"),
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(files_with_prefix(dir.path(), "frame_").len(), 2);
    let videos = files_with_prefix(dir.path(), "video_");
    assert_eq!(videos.len(), 1);
    assert_eq!(AviSummary::read(&videos[0])?.declared_frames, 2);
    engine.stop()?;
    Ok(())
}

#[test]
fn unopenable_video_aborts_session_and_releases_device() -> Result<()> {
    let dir = TempDir::new()?;
    let opener = ExclusiveOpener::new(stub("stub://cam", 100));
    let in_use = Arc::clone(&opener.in_use);
    let config = SinkConfig {
        codec: "ZZZZ".to_string(),
        ..sinks(dir.path())
    };
    let engine = CaptureEngine::with_opener(opener, config)?;
    engine.start()?;
    wait_for("video open failure", || !engine.is_running());

    assert!(matches!(engine.status(), EngineStatus::Failed(_)));
    assert!(files_with_prefix(dir.path(), "video_").is_empty());
    assert!(!in_use.load(Ordering::SeqCst));
    assert_eq!(engine.stats().sinks.video_path, None);
    Ok(())
}

#[test]
fn png_sequence_matches_frame_count() -> Result<()> {
    let dir = TempDir::new()?;
    let config = SinkConfig {
        image_extension: "png".to_string(),
        ..sinks(dir.path())
    };
    let engine = CaptureEngine::with_opener(stub("stub://png?frames=7", 200), config)?;
    engine.start()?;
    wait_for("end of stream", || !engine.is_running());

    let images = files_with_prefix(dir.path(), "frame_");
    assert_eq!(images.len(), 7);
    assert!(images
        .iter()
        .all(|path| path.extension().is_some_and(|ext| ext == "png")));
    let stats = engine.stats();
    assert_eq!(stats.sinks.images_written, 7);
    assert_eq!(stats.sinks.image_failures, 0);
    assert!(stats.throughput.is_some());
    Ok(())
}

#[test]
fn sessions_sharing_a_timestamp_keep_each_others_files() -> Result<()> {
    let dir = TempDir::new()?;
    let config = SinkConfig {
        timestamp_format: "%Y%m%d".to_string(),
        ..sinks(dir.path())
    };

    let first = CaptureEngine::with_opener(stub("stub://a?frames=5", 200), config.clone())?;
    first.start()?;
    wait_for("first session end", || !first.is_running());
    let first_video = first.stats().sinks.video_path.expect("first video");

    let second = CaptureEngine::with_opener(stub("stub://b?frames=2", 200), config)?;
    second.start()?;
    wait_for("second session end", || !second.is_running());
    let second_video = second.stats().sinks.video_path.expect("second video");

    assert_ne!(first_video, second_video);
    assert!(second_video.to_string_lossy().ends_with("_1.avi"), "{second_video:?}");
    assert_eq!(AviSummary::read(&first_video)?.declared_frames, 5);
    assert_eq!(AviSummary::read(&second_video)?.declared_frames, 2);
    assert_eq!(files_with_prefix(dir.path(), "video_").len(), 2);

    assert_eq!(files_with_prefix(dir.path(), "frame_").len(), 7);
    assert_eq!(second.stats().sinks.images_written, 2);
    Ok(())
}

#[test]
fn sink_write_failures_do_not_end_session() -> Result<()> {
    let dir = TempDir::new()?;
    let output = dir.path().join("out");
    let (opener, feed) = ChannelOpener::new();
    let engine = CaptureEngine::with_opener(opener, sinks(&output))?;
    engine.start()?;

    feed.send(Ok(rgb_frame(1)))?;
    wait_for("first frame", || engine.stats().sinks.images_written == 1);

    // Images can no longer be written; the open video file is unaffected.
    fs::remove_dir_all(&output)?;
    let resized = Frame::new(vec![7; 8 * 8 * 3], 8, 8, PixelLayout::Rgb24, 2)?;
    feed.send(Ok(resized))?;
    feed.send(Ok(rgb_frame(3)))?;
    wait_for("three frames", || engine.stats().frames_captured == 3);

    assert!(engine.is_running());
    assert_eq!(engine.status(), EngineStatus::Running);
    let stats = engine.stats();
    assert_eq!(stats.sinks.images_written, 1);
    assert_eq!(stats.sinks.image_failures, 2);
    assert_eq!(stats.sinks.video_frames, 2);
    assert_eq!(stats.sinks.video_failures, 1);
    assert_eq!(engine.get_frame().map(|frame| frame.sequence), Some(3));

    drop(feed);
    wait_for("end of stream", || !engine.is_running());
    assert_eq!(engine.status(), EngineStatus::Stopped(StopReason::EndOfStream));
    Ok(())
}
