//! Frame acquisition devices.
//!
//! This module provides the devices a capture session reads from:
//! - USB/V4L2 cameras (feature: capture-v4l2)
//! - Synthetic `stub://` devices (testing, demos)
//!
//! A device is opened by a `DeviceOpener` on every session start and then moved into
//! the acquisition thread, which is its only user until the session ends. Dropping a
//! `FrameSource` releases the device.

#[cfg(feature = "capture-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

use anyhow::Result;

use crate::frame::Frame;

pub use synthetic::SyntheticSource;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Source;

/// An open capture device.
pub trait FrameSource: Send {
    /// Human-readable device identifier for logs.
    fn describe(&self) -> String;

    /// Block until the next frame is available.
    ///
    /// - `Ok(Some(frame))`: a fresh frame
    /// - `Ok(None)`: the device reached end-of-stream
    /// - `Err(_)`: the device stopped producing frames (disconnect, I/O error)
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn stats(&self) -> SourceStats;
}

/// Opens a fresh device handle for each capture session.
pub trait DeviceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>>;

    /// Identifier used in errors and logs before a device is open.
    fn device_id(&self) -> String;
}

/// Statistics for an open device.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub device: String,
}

/// Consecutive undecodable buffers tolerated before a device is treated as failed.
pub const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 30;

/// Tracks driver buffers that could not be decoded into a frame.
///
/// A single corrupt buffer (a truncated MJPEG frame, a short read) is dropped; only a
/// run of `limit` failures without a good frame in between ends the session.
#[cfg_attr(not(feature = "capture-v4l2"), allow(dead_code))]
#[derive(Debug)]
pub(crate) struct DecodeFailures {
    consecutive: u32,
    limit: u32,
    total: u64,
}

#[cfg_attr(not(feature = "capture-v4l2"), allow(dead_code))]
impl DecodeFailures {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
            total: 0,
        }
    }

    /// Count a failure. Returns `true` while the failure may be skipped.
    pub(crate) fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.total += 1;
        self.consecutive < self.limit
    }

    /// A frame decoded; the run is over.
    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }
}

/// Device selection and requested capture format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Camera index (`0`), device node (`/dev/video0`) or `stub://name[?frames=N]`.
    pub device: String,
    /// Frame rate requested from the device.
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: "0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

impl DeviceConfig {
    /// Device node or stub URL this configuration refers to.
    pub fn resolved_device(&self) -> String {
        let trimmed = self.device.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
            format!("/dev/video{}", trimmed)
        } else {
            trimmed.to_string()
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.device.trim().starts_with("stub://")
    }
}

impl DeviceOpener for DeviceConfig {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        if self.is_synthetic() {
            let mut source = SyntheticSource::new(self.clone())?;
            source.connect()?;
            return Ok(Box::new(source));
        }

        #[cfg(feature = "capture-v4l2")]
        {
            let mut source = V4l2Source::new(self.clone())?;
            source.connect()?;
            Ok(Box::new(source))
        }
        #[cfg(not(feature = "capture-v4l2"))]
        {
            anyhow::bail!(
                "camera {} requires the capture-v4l2 feature",
                self.resolved_device()
            )
        }
    }

    fn device_id(&self) -> String {
        self.resolved_device()
    }
}
