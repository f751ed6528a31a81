//! V4L2 capture device.
//!
//! `V4l2Source` opens a local device node (e.g., /dev/video0), requests the configured
//! size and frame rate, and streams frames through an mmap buffer queue. Whatever
//! format the driver settles on (YUYV, NV12, MJPG, RGB3, GREY) is normalized before
//! it becomes a `Frame`.
//!
//! A buffer that fails to decode (a corrupt MJPEG frame, a short read) is dropped
//! with a warning and the next one is read. Only a long run of such buffers, or a
//! failed read, ends the stream.
//!
//! A read blocks until the driver delivers a buffer. Stopping a session therefore
//! waits for at most one frame interval of a healthy camera; a wedged driver can hold
//! `stop` for as long as the kernel read blocks.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize, PixelFormat};
use super::{
    DecodeFailures, DeviceConfig, FrameSource, SourceStats, MAX_CONSECUTIVE_DECODE_FAILURES,
};
use crate::frame::Frame;

pub struct V4l2Source {
    config: DeviceConfig,
    device_path: String,
    state: Option<DeviceV4l2State>,
    frame_count: u64,
    decode_failures: DecodeFailures,
    active_width: u32,
    active_height: u32,
    active_format: PixelFormat,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        Ok(Self {
            device_path: config.resolved_device(),
            active_width: config.width,
            active_height: config.height,
            active_format: PixelFormat::Yuyv,
            config,
            state: None,
            frame_count: 0,
            decode_failures: DecodeFailures::new(MAX_CONSECUTIVE_DECODE_FAILURES),
        })
    }

    /// Open the device node and start streaming.
    pub fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.device_path)
            .with_context(|| format!("open v4l2 device {}", self.device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} uses unsupported pixel format {}",
                self.device_path,
                String::from_utf8_lossy(&format.fourcc.repr)
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.device_path,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.active_format = pixel_format;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            self.device_path,
            self.active_width,
            self.active_height,
            self.active_format
        );
        Ok(())
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        self.device_path.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let width = self.active_width;
        let height = self.active_height;
        let format = self.active_format;
        let (pixels, layout) = loop {
            let state = self.state.as_mut().context("v4l2 device not connected")?;
            // Outer error: the read itself failed. Inner error: the buffer did not decode.
            let read = state.with_mut(|fields| -> Result<Result<_>> {
                let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
                let used = (meta.bytesused as usize).min(buf.len());
                let used = if used == 0 { buf.len() } else { used };
                Ok(normalize(&buf[..used], width, height, format))
            })?;
            match read {
                Ok(decoded) => {
                    self.decode_failures.reset();
                    break decoded;
                }
                Err(err) if self.decode_failures.record() => {
                    log::warn!(
                        "V4l2Source: dropping undecodable frame from {} ({} so far): {:#}",
                        self.device_path,
                        self.decode_failures.total(),
                        err
                    );
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "{} consecutive undecodable frames from {}",
                        MAX_CONSECUTIVE_DECODE_FAILURES, self.device_path
                    )));
                }
            }
        };

        self.frame_count += 1;

        let frame = Frame::new(pixels, width, height, layout, self.frame_count)?;
        Ok(Some(frame))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            device: self.device_path.clone(),
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        if self.state.take().is_some() {
            log::debug!("V4l2Source: released {}", self.device_path);
        }
    }
}
