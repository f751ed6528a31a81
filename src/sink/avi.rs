//! Motion-JPEG in AVI (RIFF) container writer.
//!
//! Layout written by `AviMjpegWriter`:
//!
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl'
//!     'avih' main header (frame count patched on close)
//!     LIST 'strl'
//!       'strh' video stream header (length patched on close)
//!       'strf' BITMAPINFOHEADER, compression 'MJPG'
//!   LIST 'movi'
//!     '00dc' JPEG frame, padded to an even length
//!     ...
//!   'idx1' one keyframe entry per frame
//! ```
//!
//! The header has a fixed size, so it is written with placeholder totals when the file
//! is created and rewritten in place by `finish`. A file that was never finished still
//! carries every frame in its `movi` list but reports zero frames.
//!
//! Every chunk is assembled in memory and written at the end of the last complete
//! chunk. Bytes left behind by a failed write are overwritten by the next frame or cut
//! off by `finish`, so the index only ever describes whole frames.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::encode_jpeg;
use super::video::{VideoEncoder, VideoSpec};
use crate::frame::{Frame, PixelLayout};

const HEADER_LEN: u64 = 224;
/// Offset of the 'movi' fourcc; idx1 offsets are relative to it.
const MOVI_FOURCC_POS: u64 = 220;
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const FRAME_CHUNK_ID: &[u8; 4] = b"00dc";

struct IndexEntry {
    offset: u32,
    size: u32,
}

pub struct AviMjpegWriter {
    file: File,
    path: PathBuf,
    spec: VideoSpec,
    index: Vec<IndexEntry>,
    /// End of the last complete chunk.
    cursor: u64,
    max_chunk: u32,
}

impl AviMjpegWriter {
    /// Create the file and write a placeholder header. Fails if the file already exists.
    pub fn create(spec: VideoSpec) -> Result<Self> {
        if spec.fps == 0 {
            return Err(anyhow!("video frame rate must be greater than zero"));
        }
        if spec.codec.len() != 4 {
            return Err(anyhow!("codec '{}' is not a fourcc", spec.codec));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&spec.path)
            .with_context(|| format!("create video file {}", spec.path.display()))?;
        write_header(&mut file, &spec, 0, 0, 0, 0)
            .with_context(|| format!("write AVI header to {}", spec.path.display()))?;
        Ok(Self {
            file,
            path: spec.path.clone(),
            spec,
            index: Vec::new(),
            cursor: HEADER_LEN,
            max_chunk: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VideoEncoder for AviMjpegWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let jpeg = encode_jpeg(frame, self.spec.quality)?;
        let size = u32::try_from(jpeg.len()).context("JPEG frame too large for AVI")?;
        let padded = u64::from(size) + u64::from(size % 2);
        // RIFF sizes are 32-bit; leave room for the index entry of this frame.
        let projected = self.cursor + 8 + padded + 8 + 16 * (self.index.len() as u64 + 1);
        if projected > u64::from(u32::MAX) {
            return Err(anyhow!("AVI file {} reached the 4 GiB limit", self.path.display()));
        }

        let mut chunk = Vec::with_capacity(8 + padded as usize);
        chunk.extend_from_slice(FRAME_CHUNK_ID);
        chunk.extend_from_slice(&size.to_le_bytes());
        chunk.extend_from_slice(&jpeg);
        if size % 2 == 1 {
            chunk.push(0);
        }
        self.file.seek(SeekFrom::Start(self.cursor))?;
        self.file
            .write_all(&chunk)
            .with_context(|| format!("append frame to {}", self.path.display()))?;

        self.index.push(IndexEntry {
            offset: (self.cursor - MOVI_FOURCC_POS) as u32,
            size,
        });
        self.cursor += chunk.len() as u64;
        self.max_chunk = self.max_chunk.max(size);
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.index.len() as u64
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let movi_end = self.cursor;
        let idx_len = 16 * self.index.len() as u64;

        let mut idx1 = Vec::with_capacity(8 + idx_len as usize);
        idx1.extend_from_slice(b"idx1");
        idx1.extend_from_slice(&(idx_len as u32).to_le_bytes());
        for entry in &self.index {
            idx1.extend_from_slice(FRAME_CHUNK_ID);
            idx1.extend_from_slice(&AVIIF_KEYFRAME.to_le_bytes());
            idx1.extend_from_slice(&entry.offset.to_le_bytes());
            idx1.extend_from_slice(&entry.size.to_le_bytes());
        }
        let file_len = movi_end + idx1.len() as u64;

        self.file.seek(SeekFrom::Start(movi_end))?;
        self.file.write_all(&idx1)?;
        self.file
            .set_len(file_len)
            .with_context(|| format!("truncate video file {}", self.path.display()))?;

        self.file.seek(SeekFrom::Start(0))?;
        let (total_frames, max_chunk) = (self.index.len() as u32, self.max_chunk);
        write_header(
            &mut self.file,
            &self.spec,
            total_frames,
            max_chunk,
            (movi_end - MOVI_FOURCC_POS) as u32,
            (file_len - 8) as u32,
        )?;
        self.file
            .sync_all()
            .with_context(|| format!("sync video file {}", self.path.display()))?;
        Ok(())
    }
}

fn write_header<W: Write>(
    out: &mut W,
    spec: &VideoSpec,
    total_frames: u32,
    max_chunk: u32,
    movi_size: u32,
    riff_size: u32,
) -> Result<()> {
    let bit_count: u16 = match spec.layout {
        PixelLayout::Rgb24 => 24,
        PixelLayout::Gray8 => 8,
    };
    let image_size = spec
        .width
        .saturating_mul(spec.height)
        .saturating_mul(u32::from(bit_count / 8));
    let suggested_buffer = max_chunk.saturating_add(8);

    let mut h = Vec::with_capacity(HEADER_LEN as usize);
    h.extend_from_slice(b"RIFF");
    h.extend_from_slice(&riff_size.to_le_bytes());
    h.extend_from_slice(b"AVI ");

    h.extend_from_slice(b"LIST");
    h.extend_from_slice(&192u32.to_le_bytes());
    h.extend_from_slice(b"hdrl");

    // avih
    h.extend_from_slice(b"avih");
    h.extend_from_slice(&56u32.to_le_bytes());
    h.extend_from_slice(&(1_000_000 / spec.fps).to_le_bytes());
    h.extend_from_slice(&max_chunk.saturating_mul(spec.fps).to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // padding granularity
    h.extend_from_slice(&AVIF_HASINDEX.to_le_bytes());
    h.extend_from_slice(&total_frames.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // initial frames
    h.extend_from_slice(&1u32.to_le_bytes()); // streams
    h.extend_from_slice(&suggested_buffer.to_le_bytes());
    h.extend_from_slice(&spec.width.to_le_bytes());
    h.extend_from_slice(&spec.height.to_le_bytes());
    h.extend_from_slice(&[0u8; 16]);

    h.extend_from_slice(b"LIST");
    h.extend_from_slice(&116u32.to_le_bytes());
    h.extend_from_slice(b"strl");

    // strh
    h.extend_from_slice(b"strh");
    h.extend_from_slice(&56u32.to_le_bytes());
    h.extend_from_slice(b"vids");
    h.extend_from_slice(spec.codec.as_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // flags
    h.extend_from_slice(&0u16.to_le_bytes()); // priority
    h.extend_from_slice(&0u16.to_le_bytes()); // language
    h.extend_from_slice(&0u32.to_le_bytes()); // initial frames
    h.extend_from_slice(&1u32.to_le_bytes()); // scale
    h.extend_from_slice(&spec.fps.to_le_bytes()); // rate
    h.extend_from_slice(&0u32.to_le_bytes()); // start
    h.extend_from_slice(&total_frames.to_le_bytes()); // length
    h.extend_from_slice(&suggested_buffer.to_le_bytes());
    h.extend_from_slice(&u32::MAX.to_le_bytes()); // quality: driver default
    h.extend_from_slice(&0u32.to_le_bytes()); // sample size
    h.extend_from_slice(&0u16.to_le_bytes());
    h.extend_from_slice(&0u16.to_le_bytes());
    h.extend_from_slice(&(spec.width.min(u32::from(u16::MAX)) as u16).to_le_bytes());
    h.extend_from_slice(&(spec.height.min(u32::from(u16::MAX)) as u16).to_le_bytes());

    // strf: BITMAPINFOHEADER
    h.extend_from_slice(b"strf");
    h.extend_from_slice(&40u32.to_le_bytes());
    h.extend_from_slice(&40u32.to_le_bytes());
    h.extend_from_slice(&(spec.width as i32).to_le_bytes());
    h.extend_from_slice(&(spec.height as i32).to_le_bytes());
    h.extend_from_slice(&1u16.to_le_bytes()); // planes
    h.extend_from_slice(&bit_count.to_le_bytes());
    h.extend_from_slice(spec.codec.as_bytes());
    h.extend_from_slice(&image_size.to_le_bytes());
    h.extend_from_slice(&[0u8; 16]); // pels per meter, colors used/important

    h.extend_from_slice(b"LIST");
    h.extend_from_slice(&movi_size.to_le_bytes());
    h.extend_from_slice(b"movi");

    debug_assert_eq!(h.len() as u64, HEADER_LEN);
    out.write_all(&h)?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Reading back
// ----------------------------------------------------------------------------

/// What a finished AVI file declares and contains.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AviSummary {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frame count declared in the main header.
    pub declared_frames: u32,
    /// Video chunks (`##dc` / `##db`) actually present in the `movi` list.
    pub frame_chunks: u32,
    /// Entries in the `idx1` index.
    pub index_entries: u32,
}

impl AviSummary {
    /// Walk the RIFF chunk tree of an AVI file.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("read video file {}", path.display()))?;
        if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"AVI " {
            return Err(anyhow!("{} is not an AVI file", path.display()));
        }
        let riff_end = (read_u32(&bytes, 4)? as usize)
            .saturating_add(8)
            .min(bytes.len());

        let mut summary = Self::default();
        let mut frame_micros = 0;
        scan_chunks(&bytes, 12, riff_end, false, &mut summary, &mut frame_micros)
            .with_context(|| format!("parse video file {}", path.display()))?;
        if frame_micros > 0 {
            summary.fps = (1_000_000f64 / f64::from(frame_micros)).round() as u32;
        }
        Ok(summary)
    }
}

fn scan_chunks(
    bytes: &[u8],
    mut pos: usize,
    end: usize,
    in_movi: bool,
    summary: &mut AviSummary,
    frame_micros: &mut u32,
) -> Result<()> {
    while pos + 8 <= end {
        let id = &bytes[pos..pos + 4];
        let size = read_u32(bytes, pos + 4)? as usize;
        let body = pos + 8;
        let body_end = body
            .checked_add(size)
            .filter(|body_end| *body_end <= end)
            .ok_or_else(|| anyhow!("chunk at offset {} overruns its parent", pos))?;

        match id {
            b"LIST" if size >= 4 => {
                let is_movi = &bytes[body..body + 4] == b"movi";
                scan_chunks(bytes, body + 4, body_end, is_movi, summary, frame_micros)?;
            }
            b"avih" => {
                *frame_micros = read_u32(bytes, body)?;
                summary.declared_frames = read_u32(bytes, body + 16)?;
                summary.width = read_u32(bytes, body + 32)?;
                summary.height = read_u32(bytes, body + 36)?;
            }
            b"idx1" => summary.index_entries = (size / 16) as u32,
            _ if in_movi && (&id[2..4] == b"dc" || &id[2..4] == b"db") => {
                summary.frame_chunks += 1;
            }
            _ => {}
        }
        pos = body_end + size % 2;
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| anyhow!("truncated AVI header"))?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
