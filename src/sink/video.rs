//! Lazily opened container-video sink.
//!
//! Output dimensions are only known once the first frame of a session arrives, so the
//! sink starts `Unopened` and opens its encoder from that frame.
//!
//! With the `record-gstreamer` feature every codec is encoded and muxed by a GStreamer
//! pipeline. Without it, the built-in Motion-JPEG AVI writer handles `MJPG` only.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

#[cfg(not(feature = "record-gstreamer"))]
use super::avi::AviMjpegWriter;
#[cfg(feature = "record-gstreamer")]
use super::gst::GstVideoEncoder;
use super::{is_already_exists, numbered_path, MAX_NAME_ATTEMPTS};
use crate::frame::{Frame, PixelLayout};

/// Codec identifiers the sink can produce.
#[cfg(feature = "record-gstreamer")]
pub const SUPPORTED_CODECS: &[&str] = &["MJPG", "XVID"];
/// Codec identifiers the sink can produce.
#[cfg(not(feature = "record-gstreamer"))]
pub const SUPPORTED_CODECS: &[&str] = &["MJPG"];
/// Container extensions the sink can produce.
pub const SUPPORTED_CONTAINERS: &[&str] = &["avi"];

/// Appends frames to one encoded video file.
pub trait VideoEncoder: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    fn frames_written(&self) -> u64;

    /// Flush, finalize the container and release the file.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Parameters a video file is opened with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoSpec {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub fps: u32,
    pub codec: String,
    pub quality: u8,
}

/// Pick an encoder for the requested codec and container. Never replaces an existing
/// file.
pub fn open_encoder(spec: VideoSpec) -> Result<Box<dyn VideoEncoder>> {
    let container = spec
        .path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match (spec.codec.as_str(), container.as_str()) {
        #[cfg(feature = "record-gstreamer")]
        (codec, "avi") if SUPPORTED_CODECS.contains(&codec) => {
            Ok(Box::new(GstVideoEncoder::create(spec)?))
        }
        #[cfg(not(feature = "record-gstreamer"))]
        ("MJPG", "avi") => Ok(Box::new(AviMjpegWriter::create(spec)?)),
        (codec, container) => Err(anyhow!(
            "no encoder for codec '{}' in '{}' container",
            codec,
            container
        )),
    }
}

enum VideoState {
    Unopened,
    Open {
        encoder: Box<dyn VideoEncoder>,
        width: u32,
        height: u32,
        layout: PixelLayout,
    },
    Closed,
}

/// One session's video file.
pub struct VideoSink {
    path: PathBuf,
    fps: u32,
    codec: String,
    quality: u8,
    state: VideoState,
    frames_written: u64,
}

impl VideoSink {
    pub fn new(path: PathBuf, fps: u32, codec: &str, quality: u8) -> Self {
        Self {
            path,
            fps,
            codec: codec.to_string(),
            quality,
            state: VideoState::Unopened,
            frames_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, VideoState::Open { .. })
    }

    /// Opened dimensions, if the first frame has arrived.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match &self.state {
            VideoState::Open { width, height, .. } => Some((*width, *height)),
            _ => None,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Open the encoder from `first` if this is the first frame of the session.
    ///
    /// If the file name is taken (another session started within the same timestamp)
    /// the video gets a `_<n>` suffix; `path()` reports the name actually used.
    pub fn ensure_open(&mut self, first: &Frame) -> Result<()> {
        match self.state {
            VideoState::Open { .. } => Ok(()),
            VideoState::Closed => Err(anyhow!(
                "video sink {} is already closed",
                self.path.display()
            )),
            VideoState::Unopened => {
                let (encoder, path) = self.open_unused_name(first)?;
                self.path = path;
                log::info!(
                    "FrameSinkSet: opened video {} ({}x{} @ {} fps, {})",
                    self.path.display(),
                    first.width,
                    first.height,
                    self.fps,
                    self.codec
                );
                self.state = VideoState::Open {
                    encoder,
                    width: first.width,
                    height: first.height,
                    layout: first.layout,
                };
                Ok(())
            }
        }
    }

    fn open_unused_name(&self, first: &Frame) -> Result<(Box<dyn VideoEncoder>, PathBuf)> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = numbered_path(&self.path, attempt);
            let spec = VideoSpec {
                path: path.clone(),
                width: first.width,
                height: first.height,
                layout: first.layout,
                fps: self.fps,
                codec: self.codec.clone(),
                quality: self.quality,
            };
            match open_encoder(spec) {
                Ok(encoder) => return Ok((encoder, path)),
                Err(err) if is_already_exists(&err) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(anyhow!(
            "no free file name for {} after {} attempts",
            self.path.display(),
            MAX_NAME_ATTEMPTS
        ))
    }

    /// Append a frame to the open encoder.
    pub fn append(&mut self, frame: &Frame) -> Result<()> {
        let VideoState::Open {
            encoder,
            width,
            height,
            layout,
        } = &mut self.state
        else {
            return Err(anyhow!("video sink {} is not open", self.path.display()));
        };
        if !frame.same_shape(*width, *height, *layout) {
            return Err(anyhow!(
                "frame {}x{} {:?} does not match video stream {}x{} {:?}",
                frame.width,
                frame.height,
                frame.layout,
                width,
                height,
                layout
            ));
        }
        encoder.write_frame(frame)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Finalize and release the encoder. A sink that never opened stays without a file.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, VideoState::Closed) {
            VideoState::Open { encoder, .. } => {
                let frames = encoder.frames_written();
                encoder.finish()?;
                log::info!(
                    "FrameSinkSet: closed video {} ({} frames)",
                    self.path.display(),
                    frames
                );
                Ok(())
            }
            VideoState::Unopened | VideoState::Closed => Ok(()),
        }
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!(
                "FrameSinkSet: failed to finalize video {}: {:#}",
                self.path.display(),
                err
            );
        }
    }
}
