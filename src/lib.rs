//! Continuous camera capture pipeline.
//!
//! A [`CaptureEngine`] owns one capture device. While a session runs, a dedicated
//! acquisition thread reads frames and, for every frame, in order:
//!
//! 1. records it in the session's [`RateTracker`]
//! 2. writes it as an image file (`frame_<timestamp>_<index>.<ext>`)
//! 3. appends it to the session video (`video_<session-start>.avi`, opened from the
//!    first frame's dimensions)
//! 4. publishes it to the latest-frame slot read by [`CaptureEngine::get_frame`]
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the latest-frame `FrameSlot`
//! - `ingest`: capture devices (V4L2, synthetic `stub://`)
//! - `sink`: image sequence and AVI video writers (GStreamer or built-in MJPEG)
//! - `rate`: frames-per-second accounting
//! - `engine`: session state machine and acquisition loop
//! - `config`: file + environment configuration for `camerad`

pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod rate;
pub mod sink;
pub mod ui;

pub use config::PipelineConfig;
pub use engine::{CancelToken, CaptureEngine, EngineStatus, SessionStats, StopReason};
pub use error::CaptureError;
pub use frame::{Frame, FrameSlot, PixelLayout};
pub use ingest::{DeviceConfig, DeviceOpener, FrameSource, SourceStats, SyntheticSource};
pub use rate::RateTracker;
pub use sink::{AviSummary, FrameSinkSet, SinkConfig, SinkStats};
