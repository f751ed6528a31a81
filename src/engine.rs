//! Capture engine: session lifecycle and the acquisition loop.
//!
//! ```text
//!            start() ok
//!   Idle ───────────────▶ Running
//!    ▲                      │ stop() / end-of-stream / read failure / video open failure
//!    └──────────────────────┘  (Stopped or Failed, reusable)
//! ```
//!
//! The device and the session's sinks are moved into the acquisition thread and
//! released there. `stop` joins that thread, so once it returns a new session can open
//! the same device and output directory.

use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::error::CaptureError;
use crate::frame::{Frame, FrameSlot};
use crate::ingest::{DeviceOpener, FrameSource};
use crate::rate::RateTracker;
use crate::sink::{ensure_output_dir, FrameSinkSet, SinkConfig, SinkStats};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Public state types
// ----------------------------------------------------------------------------

/// Why a session ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called.
    Requested,
    /// The device signalled end-of-stream.
    EndOfStream,
}

/// What a presentation layer needs to render the capture state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EngineStatus {
    /// No session has been started yet.
    #[default]
    Idle,
    Running,
    Stopped(StopReason),
    /// The last session ended because of a device read failure or a video sink that
    /// could not be opened.
    Failed(String),
}

/// Snapshot of the current (or last) session, refreshed after every frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStats {
    pub started_at: Option<DateTime<Local>>,
    pub frames_captured: u64,
    /// Frames per second since the session started; `None` until measurable.
    pub throughput: Option<f64>,
    pub sinks: SinkStats,
}

/// Cooperative cancellation signal shared with the acquisition loop.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Shared state (acquisition thread <-> control/consumer)
// ----------------------------------------------------------------------------

#[derive(Default)]
struct SharedState {
    slot: FrameSlot,
    status: Mutex<EngineStatus>,
    stats: Mutex<SessionStats>,
}

impl SharedState {
    fn status(&self) -> EngineStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn stats(&self) -> SessionStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_stats(&self, stats: SessionStats) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
    }
}

struct SessionHandle {
    device: String,
    cancel: CancelToken,
    join: JoinHandle<()>,
}

// ----------------------------------------------------------------------------
// CaptureEngine
// ----------------------------------------------------------------------------

/// Control API over one capture device.
///
/// `start`/`stop` are serialized by an internal lock. `get_frame`, `status` and
/// `stats` never take that lock and can be polled from any thread.
pub struct CaptureEngine {
    opener: Box<dyn DeviceOpener>,
    sinks: SinkConfig,
    control: Mutex<Option<SessionHandle>>,
    shared: Arc<SharedState>,
}

impl CaptureEngine {
    /// Engine for the configured device and outputs.
    pub fn new(config: &PipelineConfig) -> Result<Self, CaptureError> {
        Self::with_opener(config.device.clone(), config.sinks.clone())
    }

    /// Engine over any device opener. The output directory is created here.
    pub fn with_opener(
        opener: impl DeviceOpener + 'static,
        sinks: SinkConfig,
    ) -> Result<Self, CaptureError> {
        ensure_output_dir(&sinks.output_dir).map_err(CaptureError::Output)?;
        Ok(Self {
            opener: Box::new(opener),
            sinks,
            control: Mutex::new(None),
            shared: Arc::new(SharedState::default()),
        })
    }

    pub fn sink_config(&self) -> &SinkConfig {
        &self.sinks
    }

    /// Open the device and launch the acquisition loop. Returns without waiting for
    /// the first frame.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut control = self.control.lock().map_err(|_| CaptureError::Poisoned)?;
        if let Some(handle) = control.take() {
            if !handle.join.is_finished() {
                *control = Some(handle);
                return Err(CaptureError::AlreadyRunning);
            }
            // The previous session ended on its own; reap its thread.
            self.join_session(handle)?;
        }

        let started_at = Local::now();
        let sinks = FrameSinkSet::new(&self.sinks, started_at).map_err(CaptureError::Output)?;
        let device_id = self.opener.device_id();
        let source = self
            .opener
            .open()
            .map_err(|source| CaptureError::DeviceUnavailable {
                device: device_id.clone(),
                source,
            })?;

        self.shared.slot.clear();
        self.shared.set_stats(SessionStats {
            started_at: Some(started_at),
            ..SessionStats::default()
        });
        self.shared.set_status(EngineStatus::Running);

        let cancel = CancelToken::new();
        let session = CaptureSession {
            source,
            sinks,
            rate: RateTracker::new(),
            frame_index: 0,
            started_at,
            cancel: cancel.clone(),
            shared: Arc::clone(&self.shared),
        };
        let join = std::thread::Builder::new()
            .name("capture-loop".to_string())
            .spawn(move || session.run())
            .map_err(|err| {
                self.shared
                    .set_status(EngineStatus::Failed(format!("spawn capture thread: {}", err)));
                CaptureError::Spawn(err)
            })?;

        log::info!("CaptureEngine: session started on {}", device_id);
        *control = Some(SessionHandle {
            device: device_id,
            cancel,
            join,
        });
        Ok(())
    }

    /// Stop the running session and wait until its device and video file are released.
    ///
    /// A no-op when idle.
    pub fn stop(&self) -> Result<(), CaptureError> {
        let mut control = self.control.lock().map_err(|_| CaptureError::Poisoned)?;
        let Some(handle) = control.take() else {
            return Ok(());
        };
        handle.cancel.cancel();
        self.join_session(handle)
    }

    /// Most recently published frame of the running session.
    pub fn get_frame(&self) -> Option<Frame> {
        self.shared.slot.latest()
    }

    pub fn is_running(&self) -> bool {
        self.shared.status() == EngineStatus::Running
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    fn join_session(&self, handle: SessionHandle) -> Result<(), CaptureError> {
        if handle.join.join().is_err() {
            self.shared.slot.clear();
            self.shared
                .set_status(EngineStatus::Failed("capture thread panicked".to_string()));
            log::error!("CaptureEngine: capture thread for {} panicked", handle.device);
            return Err(CaptureError::ThreadPanicked);
        }
        log::info!(
            "CaptureEngine: session on {} ended ({:?})",
            handle.device,
            self.shared.status()
        );
        Ok(())
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("CaptureEngine: failed to stop on drop: {}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Acquisition loop
// ----------------------------------------------------------------------------

/// Everything one session owns. Lives on the acquisition thread.
struct CaptureSession {
    source: Box<dyn FrameSource>,
    sinks: FrameSinkSet,
    rate: RateTracker,
    frame_index: u64,
    started_at: DateTime<Local>,
    cancel: CancelToken,
    shared: Arc<SharedState>,
}

impl CaptureSession {
    fn run(mut self) {
        self.rate.start();
        let outcome = self.acquire();

        let device = self.source.describe();
        let source_stats = self.source.stats();
        let CaptureSession {
            source,
            mut sinks,
            rate,
            started_at,
            shared,
            ..
        } = self;

        // Release the device and finalize the video before reporting Idle.
        drop(source);
        sinks.close();
        shared.slot.clear();
        shared.set_stats(SessionStats {
            started_at: Some(started_at),
            frames_captured: rate.frame_count(),
            throughput: rate.throughput(),
            sinks: sinks.stats().clone(),
        });
        drop(sinks);

        let status = match outcome {
            Ok(reason) => {
                log::info!(
                    "CaptureEngine: {} stopped ({:?}) after {} frames ({} read from device)",
                    device,
                    reason,
                    rate.frame_count(),
                    source_stats.frames_captured
                );
                EngineStatus::Stopped(reason)
            }
            Err(reason) => {
                log::error!("CaptureEngine: {} session aborted: {}", device, reason);
                EngineStatus::Failed(reason)
            }
        };
        shared.set_status(status);
    }

    /// Read and process frames until cancelled or the session must end.
    fn acquire(&mut self) -> Result<StopReason, String> {
        let mut last_stats_log = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(StopReason::Requested);
            }

            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(StopReason::EndOfStream),
                Err(err) => return Err(format!("device read failed: {:#}", err)),
            };

            // A frame that arrives after stop() was requested belongs to no session.
            if self.cancel.is_cancelled() {
                log::debug!("CaptureEngine: discarding frame captured during shutdown");
                return Ok(StopReason::Requested);
            }

            self.process(frame)?;

            if last_stats_log.elapsed() >= STATS_LOG_INTERVAL {
                log::info!(
                    "CaptureEngine: {} frames, {:.1} fps",
                    self.rate.frame_count(),
                    self.rate.throughput().unwrap_or(0.0)
                );
                last_stats_log = Instant::now();
            }
        }
    }

    /// Image, video, publish: all three for this frame before the next read.
    fn process(&mut self, frame: Frame) -> Result<(), String> {
        self.rate.record_frame();
        let index = self.frame_index;
        self.frame_index += 1;

        self.sinks.write_image(&frame, index);
        self.sinks
            .write_video_frame(&frame)
            .map_err(|err| format!("video sink failed: {:#}", err))?;

        self.shared.slot.publish(frame);
        self.shared.set_stats(SessionStats {
            started_at: Some(self.started_at),
            frames_captured: self.rate.frame_count(),
            throughput: self.rate.throughput(),
            sinks: self.sinks.stats().clone(),
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
