//! Synthetic (`stub://`) capture device.
//!
//! Produces a moving RGB test pattern at the configured frame rate. A `frames=N`
//! query (`stub://bench?frames=5`) makes the device signal end-of-stream after N
//! frames, which is how tests simulate an unplugged camera or a finite feed.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{DeviceConfig, FrameSource, SourceStats};
use crate::frame::{Frame, PixelLayout};

pub struct SyntheticSource {
    config: DeviceConfig,
    frame_limit: Option<u64>,
    frame_count: u64,
    /// Simulated "scene" state, bumped every 50 frames.
    scene_state: u8,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic device needs non-zero dimensions"));
        }
        let frame_limit = parse_frame_limit(&config.device)?;
        Ok(Self {
            config,
            frame_limit,
            frame_count: 0,
            scene_state: 0,
            next_due: None,
        })
    }

    /// Synthetic devices are always "connected".
    pub fn connect(&mut self) -> Result<()> {
        self.next_due = Some(Instant::now() + self.frame_interval());
        log::info!(
            "SyntheticSource: connected to {} ({}x{} @ {} fps)",
            self.config.device,
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.config.target_fps as f64)
        }
    }

    /// Sleep until the next frame is due. This is the blocking "device read".
    fn wait_for_frame(&mut self) {
        let due = self.next_due.unwrap_or_else(Instant::now);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
        // Schedule from the due time so pacing does not drift, but never in the past.
        let next = due + self.frame_interval();
        self.next_due = Some(next.max(Instant::now()));
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width as usize) * (self.config.height as usize) * 3;

        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        self.config.device.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                log::info!(
                    "SyntheticSource: {} reached end of stream after {} frames",
                    self.config.device,
                    self.frame_count
                );
                return Ok(None);
            }
        }

        self.wait_for_frame();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        let frame = Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            PixelLayout::Rgb24,
            self.frame_count,
        )?;
        Ok(Some(frame))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            device: self.config.device.clone(),
        }
    }
}

fn parse_frame_limit(device: &str) -> Result<Option<u64>> {
    let Some((_, query)) = device.split_once('?') else {
        return Ok(None);
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("frames=") {
            let limit = value
                .parse::<u64>()
                .map_err(|_| anyhow!("invalid frame limit '{}' in {}", value, device))?;
            return Ok(Some(limit));
        }
    }
    Ok(None)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
