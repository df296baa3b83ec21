//! Frame dump mode.
//!
//! Instead of streaming, the first N presented frames are written to a
//! directory as PNG files, each with a line in `summary.txt` describing what
//! the frame looks like. This answers "is the application rendering anything at
//! all" without a consumer on the other end.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use ash::vk;
use image::{ImageFormat, RgbaImage};
use log::{info, warn};
use thiserror::Error;

use crate::capture::STAGING_SENTINEL;
use crate::config::DumpConfig;
use crate::frame::{DropReason, FrameDisposition, FrameSink, FrameView};

/// Name of the per-directory summary file.
pub const SUMMARY_FILE: &str = "summary.txt";

/// Coarse description of one frame's contents.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameSummary {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    /// Fraction of pixels with any non-zero color channel.
    pub non_black_ratio: f64,
    /// Pixels at the top-left, top-right, center, bottom-left and bottom-right.
    pub samples: [[u8; 4]; 5],
    /// Every pixel still holds the staging fill pattern: no copy ever landed.
    pub untouched: bool,
}

impl FrameSummary {
    pub fn compute(index: u32, frame: &FrameView<'_>) -> Self {
        let (width, height) = (frame.width(), frame.height());
        let total = width as u64 * height as u64;

        let mut non_black = 0u64;
        let mut sentinel = 0u64;
        for row in frame.rows() {
            for pixel in row.chunks_exact(4) {
                if pixel[..3].iter().any(|&c| c != 0) {
                    non_black += 1;
                }
                if pixel.iter().all(|&b| b == STAGING_SENTINEL) {
                    sentinel += 1;
                }
            }
        }

        let samples = if total == 0 {
            [[0; 4]; 5]
        } else {
            let (right, bottom) = (width - 1, height - 1);
            [
                frame.pixel(0, 0),
                frame.pixel(right, 0),
                frame.pixel(width / 2, height / 2),
                frame.pixel(0, bottom),
                frame.pixel(right, bottom),
            ]
        };

        Self {
            index,
            width,
            height,
            non_black_ratio: if total == 0 { 0.0 } else { non_black as f64 / total as f64 },
            samples,
            untouched: total > 0 && sentinel == total,
        }
    }

    /// A frame with no visible content at all.
    pub fn is_black(&self) -> bool {
        self.non_black_ratio == 0.0
    }
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame {:04} {}x{} non_black={:.2}%",
            self.index,
            self.width,
            self.height,
            self.non_black_ratio * 100.0
        )?;
        for (label, [b0, b1, b2, b3]) in ["tl", "tr", "c", "bl", "br"].iter().zip(self.samples) {
            write!(f, " {label}={b0:02x}{b1:02x}{b2:02x}{b3:02x}")?;
        }
        if self.untouched {
            f.write_str(" UNTOUCHED")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
enum DumpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// A [`FrameSink`] that writes frames to disk.
pub struct FrameDump {
    directory: PathBuf,
    limit: u32,
    written: u32,
    directory_ready: bool,
    rgba: Vec<u8>,
}

impl FrameDump {
    pub fn new(config: &DumpConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            limit: config.frames,
            written: 0,
            directory_ready: false,
            rgba: Vec::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn frames_written(&self) -> u32 {
        self.written
    }

    pub fn is_finished(&self) -> bool {
        self.written >= self.limit
    }

    /// Path of the PNG for frame `index`.
    pub fn frame_path(&self, index: u32) -> PathBuf {
        self.directory.join(format!("frame_{index:04}.png"))
    }

    fn write(&mut self, frame: &FrameView<'_>) -> Result<FrameSummary, DumpError> {
        if !self.directory_ready {
            fs::create_dir_all(&self.directory)?;
            self.directory_ready = true;
        }
        let index = self.written;
        let summary = FrameSummary::compute(index, frame);

        self.rgba.clear();
        frame.write_packed(&mut self.rgba);
        if is_bgra(frame.format()) {
            bgra_to_rgba(&mut self.rgba);
        }
        let pixels = std::mem::take(&mut self.rgba);
        let image = RgbaImage::from_raw(frame.width(), frame.height(), pixels)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame buffer too small"))?;
        let saved = image.save_with_format(self.frame_path(index), ImageFormat::Png);
        self.rgba = image.into_raw();
        saved?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.directory.join(SUMMARY_FILE))?;
        writeln!(log, "{summary}")?;
        Ok(summary)
    }
}

impl FrameSink for FrameDump {
    fn consume(&mut self, frame: &FrameView<'_>) -> FrameDisposition {
        if self.is_finished() {
            return FrameDisposition::Dropped(DropReason::DumpLimitReached);
        }
        match self.write(frame) {
            Ok(summary) => {
                self.written += 1;
                info!("dumped {summary}");
                if self.is_finished() {
                    info!(
                        "frame dump complete: {} frames in {}",
                        self.written,
                        self.directory.display()
                    );
                }
                FrameDisposition::Delivered
            }
            Err(err) => {
                warn!("frame dump failed: {err}");
                FrameDisposition::Dropped(DropReason::Io)
            }
        }
    }
}

fn is_bgra(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB
    )
}

/// Swaps the red and blue channel of every pixel in place.
pub fn bgra_to_rgba(pixels: &mut [u8]) {
    #[cfg(target_arch = "x86_64")]
    {
        if pixels.len() >= 16 && is_x86_feature_detected!("ssse3") {
            return unsafe { bgra_to_rgba_ssse3(pixels) };
        }
    }
    bgra_to_rgba_scalar(pixels)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "ssse3")]
unsafe fn bgra_to_rgba_ssse3(pixels: &mut [u8]) {
    use std::arch::x86_64::{__m128i, _mm_loadu_si128, _mm_set_epi8, _mm_shuffle_epi8, _mm_storeu_si128};

    let mut chunks = pixels.chunks_exact_mut(16);
    for chunk in &mut chunks {
        unsafe {
            let data = _mm_loadu_si128(chunk.as_ptr().cast::<__m128i>());
            let swapped = _mm_shuffle_epi8(
                data,
                _mm_set_epi8(15, 12, 13, 14, 11, 8, 9, 10, 7, 4, 5, 6, 3, 0, 1, 2),
            );
            _mm_storeu_si128(chunk.as_mut_ptr().cast::<__m128i>(), swapped);
        }
    }
    bgra_to_rgba_scalar(chunks.into_remainder());
}

fn bgra_to_rgba_scalar(pixels: &mut [u8]) {
    for pixel in pixels.chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }
}
