use anyhow::{anyhow, Context, Result};
use chrono::Local;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::ingest::DeviceConfig;
use crate::sink::image_seq::image_format_for;
use crate::sink::video::{SUPPORTED_CODECS, SUPPORTED_CONTAINERS};
use crate::sink::{format_timestamp, SinkConfig};

pub const CONFIG_ENV: &str = "CAMERA_PIPELINE_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    log_file: Option<PathBuf>,
    device: Option<DeviceConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DeviceConfigFile {
    device: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    dir: Option<PathBuf>,
    image_extension: Option<String>,
    container_extension: Option<String>,
    codec: Option<String>,
    video_fps: Option<u32>,
    jpeg_quality: Option<u8>,
    timestamp_format: Option<String>,
}

/// Everything `camerad` needs to run a capture session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub device: DeviceConfig,
    pub sinks: SinkConfig,
    /// Append log records to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl PipelineConfig {
    /// Defaults, then the file named by `CAMERA_PIPELINE_CONFIG`, then `CAMERA_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var(CONFIG_ENV).ok().as_deref() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(path))?,
            _ => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load an explicit config file. Environment overrides still apply.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let device_defaults = DeviceConfig::default();
        let device_file = file.device.unwrap_or_default();
        let device = DeviceConfig {
            device: device_file.device.unwrap_or(device_defaults.device),
            target_fps: device_file.target_fps.unwrap_or(device_defaults.target_fps),
            width: device_file.width.unwrap_or(device_defaults.width),
            height: device_file.height.unwrap_or(device_defaults.height),
        };

        let sink_defaults = SinkConfig::default();
        let output = file.output.unwrap_or_default();
        let sinks = SinkConfig {
            output_dir: output.dir.unwrap_or(sink_defaults.output_dir),
            image_extension: output
                .image_extension
                .unwrap_or(sink_defaults.image_extension),
            container_extension: output
                .container_extension
                .unwrap_or(sink_defaults.container_extension),
            codec: output.codec.unwrap_or(sink_defaults.codec),
            video_fps: output.video_fps.unwrap_or(sink_defaults.video_fps),
            jpeg_quality: output.jpeg_quality.unwrap_or(sink_defaults.jpeg_quality),
            timestamp_format: output
                .timestamp_format
                .unwrap_or(sink_defaults.timestamp_format),
        };

        Self {
            device,
            sinks,
            log_file: file.log_file,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.device.device = device.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("CAMERA_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.sinks.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(fps) = std::env::var("CAMERA_FPS") {
            self.device.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMERA_FPS must be an integer frame rate"))?;
        }
        if let Ok(fps) = std::env::var("CAMERA_VIDEO_FPS") {
            self.sinks.video_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMERA_VIDEO_FPS must be an integer frame rate"))?;
        }
        Ok(())
    }

    /// Reject settings that would only fail once frames are flowing.
    pub fn validate(&mut self) -> Result<()> {
        if self.device.device.trim().is_empty() {
            return Err(anyhow!("device must not be empty"));
        }
        if self.device.target_fps == 0 {
            return Err(anyhow!("device target_fps must be greater than zero"));
        }
        if self.device.width == 0 || self.device.height == 0 {
            return Err(anyhow!("device width and height must be greater than zero"));
        }
        if self.sinks.video_fps == 0 {
            return Err(anyhow!("video_fps must be greater than zero"));
        }
        if !(1..=100).contains(&self.sinks.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }

        image_format_for(&self.sinks.image_extension)?;
        self.sinks.image_extension = self.sinks.image_extension.to_ascii_lowercase();

        self.sinks.codec = self.sinks.codec.to_ascii_uppercase();
        if !SUPPORTED_CODECS.contains(&self.sinks.codec.as_str()) {
            return Err(anyhow!(
                "unsupported codec '{}' (supported: {})",
                self.sinks.codec,
                SUPPORTED_CODECS.join(", ")
            ));
        }
        self.sinks.container_extension = self.sinks.container_extension.to_ascii_lowercase();
        if !SUPPORTED_CONTAINERS.contains(&self.sinks.container_extension.as_str()) {
            return Err(anyhow!(
                "unsupported container '{}' (supported: {})",
                self.sinks.container_extension,
                SUPPORTED_CONTAINERS.join(", ")
            ));
        }

        format_timestamp(&Local::now(), &self.sinks.timestamp_format)
            .context("invalid timestamp_format")?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
