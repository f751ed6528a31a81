//! One image file per captured frame.

use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use super::{
    encode_jpeg, format_timestamp, is_already_exists, numbered_path, MAX_NAME_ATTEMPTS,
};
use crate::frame::Frame;

pub struct ImageSequenceWriter {
    dir: PathBuf,
    extension: String,
    format: ImageFormat,
    timestamp_format: String,
    jpeg_quality: u8,
}

impl ImageSequenceWriter {
    pub fn new(
        dir: &Path,
        extension: &str,
        timestamp_format: &str,
        jpeg_quality: u8,
    ) -> Result<Self> {
        let format = image_format_for(extension)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            extension: extension.to_ascii_lowercase(),
            format,
            timestamp_format: timestamp_format.to_string(),
            jpeg_quality,
        })
    }

    /// `frame_<timestamp>_<index:04>.<ext>` for a frame captured at its own timestamp.
    pub fn file_name(&self, frame: &Frame, index: u64) -> Result<String> {
        let stamp = format_timestamp(&frame.captured_at, &self.timestamp_format)?;
        Ok(format!("frame_{}_{:04}.{}", stamp, index, self.extension))
    }

    /// Encode and write one frame. The file appears under its final name only once it
    /// is complete, and never replaces an existing file: a taken name gets a `_<n>`
    /// suffix.
    pub fn write(&self, frame: &Frame, index: u64) -> Result<PathBuf> {
        let base = self.dir.join(self.file_name(frame, index)?);
        let encoded = self.encode(frame)?;
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = numbered_path(&base, attempt);
            match write_new(&path, &encoded) {
                Ok(()) => return Ok(path),
                Err(err) if is_already_exists(&err) => continue,
                Err(err) => return Err(err.context(format!("write image {}", path.display()))),
            }
        }
        Err(anyhow!(
            "no free file name for {} after {} attempts",
            base.display(),
            MAX_NAME_ATTEMPTS
        ))
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        if self.format == ImageFormat::Jpeg {
            return encode_jpeg(frame, self.jpeg_quality);
        }
        let mut cursor = Cursor::new(Vec::new());
        image::write_buffer_with_format(
            &mut cursor,
            frame.pixels(),
            frame.width,
            frame.height,
            frame.layout.color_type(),
            self.format,
        )
        .with_context(|| format!("encode frame as {:?}", self.format))?;
        Ok(cursor.into_inner())
    }
}

/// Image formats the sequence writer can produce.
pub fn image_format_for(extension: &str) -> Result<ImageFormat> {
    match ImageFormat::from_extension(extension) {
        Some(format @ (ImageFormat::Jpeg | ImageFormat::Png)) => Ok(format),
        _ => Err(anyhow!(
            "unsupported image extension '{}' (expected jpg, jpeg or png)",
            extension
        )),
    }
}

/// Write to a temp file, then link it into place. Fails with `AlreadyExists` instead
/// of replacing `path`.
fn write_new(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    if let Err(err) = File::create(&tmp_path).and_then(|mut file| file.write_all(data)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    let published = match fs::hard_link(&tmp_path, path) {
        Err(err) if err.kind() != std::io::ErrorKind::AlreadyExists && !path.exists() => {
            // Filesystems without hard links.
            fs::rename(&tmp_path, path)
        }
        other => other,
    };
    let _ = fs::remove_file(&tmp_path);
    published?;
    Ok(())
}
