//! Captured frames and the latest-frame exchange.
//!
//! - `Frame`: Immutable pixel snapshot. Pixel storage is shared, so cloning a frame
//!   never copies or mutates pixel data.
//! - `FrameSlot`: Single-slot hand-off between the acquisition loop and a polling
//!   consumer. Publishing overwrites; reading does not consume.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use image::{ExtendedColorType, RgbImage};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

// ----------------------------------------------------------------------------
// PixelLayout
// ----------------------------------------------------------------------------

/// Channel layout of a frame's pixel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    /// 8-bit R, G, B interleaved.
    Rgb24,
    /// 8-bit luma.
    Gray8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Rgb24 => 3,
            PixelLayout::Gray8 => 1,
        }
    }

    pub(crate) fn color_type(self) -> ExtendedColorType {
        match self {
            PixelLayout::Rgb24 => ExtendedColorType::Rgb8,
            PixelLayout::Gray8 => ExtendedColorType::L8,
        }
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image captured from the device.
///
/// There is no mutable pixel accessor: once a frame has been handed to the sinks and
/// published, every holder sees the same bytes.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Local>,
    /// 1-based position in the stream produced by the source since it was opened.
    pub sequence: u64,
}

impl Frame {
    /// Wrap a pixel buffer captured now. Fails if the buffer length does not match
    /// `width * height * bytes_per_pixel`.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        sequence: u64,
    ) -> Result<Self> {
        Self::captured(data, width, height, layout, sequence, Local::now())
    }

    pub fn captured(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        sequence: u64,
        captured_at: DateTime<Local>,
    ) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(layout.bytes_per_pixel()))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch for {}x{} {:?}: expected {}, got {}",
                width,
                height,
                layout,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            layout,
            captured_at,
            sequence,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the pixel storage, for consumers that need an owned buffer.
    #[cfg_attr(not(feature = "record-gstreamer"), allow(dead_code))]
    pub(crate) fn pixel_buffer(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Copy into an RGB image for a display surface. Gray frames are expanded.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        match self.layout {
            PixelLayout::Rgb24 => RgbImage::from_raw(self.width, self.height, self.data.to_vec()),
            PixelLayout::Gray8 => {
                let rgb = self.data.iter().flat_map(|&l| [l, l, l]).collect();
                RgbImage::from_raw(self.width, self.height, rgb)
            }
        }
    }

    pub(crate) fn same_shape(&self, width: u32, height: u32, layout: PixelLayout) -> bool {
        self.width == width && self.height == height && self.layout == layout
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: latest-frame exchange
// ----------------------------------------------------------------------------

/// Mutex-guarded single-element holder for the most recently published frame.
///
/// The lock is held only for the duration of a pointer swap or an `Arc` clone, so a
/// reader never observes a partially written frame and never stalls the acquisition
/// loop for longer than that.
#[derive(Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever was published before.
    pub fn publish(&self, frame: Frame) {
        // A poisoned slot still holds a whole frame (or none); the swap is the only write.
        let mut guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(frame);
    }

    /// The current frame, if any. Repeated calls return the same frame until the next publish.
    pub fn latest(&self) -> Option<Frame> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
