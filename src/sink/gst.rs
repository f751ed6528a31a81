//! GStreamer-backed video encoder.
//!
//! Pipeline: `appsrc ! videoconvert ! <encoder> ! avimux ! filesink`
//!
//! Raw frames are pushed with timestamps derived from the declared frame rate, so the
//! container timeline matches `fps` regardless of how fast the device delivered them.
//! `finish` sends end-of-stream and waits for the muxer to finalize the file.

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::video::{VideoEncoder, VideoSpec};
use crate::frame::{Frame, PixelLayout};

/// How long `finish` waits for the muxer to drain.
const FINISH_TIMEOUT_SECS: u64 = 10;

/// Encoder element for a codec fourcc.
fn encoder_element(codec: &str, quality: u8) -> Result<gst::Element> {
    match codec {
        "MJPG" => gst::ElementFactory::make("jpegenc")
            .property("quality", i32::from(quality.clamp(1, 100)))
            .build()
            .context("create jpegenc"),
        "XVID" => gst::ElementFactory::make("avenc_mpeg4")
            .build()
            .context("create avenc_mpeg4"),
        other => Err(anyhow!("no GStreamer encoder for codec '{}'", other)),
    }
}

pub struct GstVideoEncoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    path: PathBuf,
    fps: u32,
    /// Row stride GStreamer expects; differs from the packed stride for odd RGB widths.
    stride: usize,
    frames: u64,
}

impl GstVideoEncoder {
    /// Build and start the pipeline. Fails if the file already exists.
    pub fn create(spec: VideoSpec) -> Result<Self> {
        if spec.fps == 0 {
            return Err(anyhow!("video frame rate must be greater than zero"));
        }
        gst::init().context("initialize gstreamer")?;

        // filesink truncates; claim the name first so an existing file is never replaced.
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&spec.path)
            .with_context(|| format!("create video file {}", spec.path.display()))?;

        match Self::build(&spec) {
            Ok(encoder) => Ok(encoder),
            Err(err) => {
                let _ = std::fs::remove_file(&spec.path);
                Err(err)
            }
        }
    }

    fn build(spec: &VideoSpec) -> Result<Self> {
        let format = match spec.layout {
            PixelLayout::Rgb24 => gst_video::VideoFormat::Rgb,
            PixelLayout::Gray8 => gst_video::VideoFormat::Gray8,
        };
        let fps = i32::try_from(spec.fps).context("video frame rate out of range")?;
        let info = gst_video::VideoInfo::builder(format, spec.width, spec.height)
            .fps(gst::Fraction::new(fps, 1))
            .build()
            .context("describe raw video format")?;
        let caps = info.to_caps().context("build raw video caps")?;
        let stride = usize::try_from(info.stride()[0]).context("negative row stride")?;

        let appsrc = gst_app::AppSrc::builder()
            .caps(&caps)
            .format(gst::Format::Time)
            .block(true)
            .build();
        let convert = gst::ElementFactory::make("videoconvert")
            .build()
            .context("create videoconvert")?;
        let encoder = encoder_element(&spec.codec, spec.quality)?;
        let muxer = gst::ElementFactory::make("avimux")
            .build()
            .context("create avimux")?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", spec.path.to_string_lossy().to_string())
            .build()
            .context("create filesink")?;

        let pipeline = gst::Pipeline::new();
        let elements = [appsrc.upcast_ref(), &convert, &encoder, &muxer, &filesink];
        pipeline
            .add_many(elements)
            .context("add elements to recording pipeline")?;
        gst::Element::link_many(elements).context("link recording pipeline")?;
        pipeline
            .set_state(gst::State::Playing)
            .context("set recording pipeline to Playing")?;

        log::info!(
            "GstVideoEncoder: recording {} {}x{} @ {} fps to {}",
            spec.codec,
            spec.width,
            spec.height,
            spec.fps,
            spec.path.display()
        );
        Ok(Self {
            pipeline,
            appsrc,
            path: spec.path.clone(),
            fps: spec.fps,
            stride,
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn frame_time(&self, index: u64) -> gst::ClockTime {
        gst::ClockTime::from_nseconds(index * 1_000_000_000 / u64::from(self.fps))
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = message.view() {
                return Err(anyhow!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
        }
        Ok(())
    }

    fn buffer_for(&self, frame: &Frame) -> gst::Buffer {
        let row = frame.width as usize * frame.layout.bytes_per_pixel();
        if row == self.stride {
            return gst::Buffer::from_slice(frame.pixel_buffer());
        }
        let mut padded = vec![0u8; self.stride * frame.height as usize];
        for (dst, src) in padded
            .chunks_exact_mut(self.stride)
            .zip(frame.pixels().chunks_exact(row))
        {
            dst[..row].copy_from_slice(src);
        }
        gst::Buffer::from_mut_slice(padded)
    }
}

impl VideoEncoder for GstVideoEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.check_bus()?;

        let mut buffer = self.buffer_for(frame);
        let (pts, next) = (self.frame_time(self.frames), self.frame_time(self.frames + 1));
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(pts);
            buffer.set_duration(next - pts);
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|err| anyhow!("push frame to {}: {:?}", self.path.display(), err))?;
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.appsrc
            .end_of_stream()
            .map_err(|err| anyhow!("end stream for {}: {:?}", self.path.display(), err))?;

        let bus = self
            .pipeline
            .bus()
            .context("recording pipeline has no bus")?;
        let mut outcome = Err(anyhow!(
            "timed out finalizing {} after {:?}",
            self.path.display(),
            Duration::from_secs(FINISH_TIMEOUT_SECS)
        ));
        for message in bus.iter_timed(gst::ClockTime::from_seconds(FINISH_TIMEOUT_SECS)) {
            match message.view() {
                gst::MessageView::Eos(..) => {
                    outcome = Ok(());
                    break;
                }
                gst::MessageView::Error(err) => {
                    outcome = Err(anyhow!(
                        "gstreamer error finalizing {}: {}",
                        self.path.display(),
                        err.error()
                    ));
                    break;
                }
                _ => {}
            }
        }
        self.pipeline
            .set_state(gst::State::Null)
            .context("stop recording pipeline")?;
        outcome
    }
}

impl Drop for GstVideoEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
