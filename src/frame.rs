//! Decoded video frames.
//!
//! A `VideoFrame` is an immutable snapshot: the pixel data sits behind an
//! `Arc`, so cloning a frame (or handing it to several consumers at once) is
//! cheap and never allows one consumer to observe another's writes.

use anyhow::{anyhow, Result};
use std::sync::Arc;

/// Pixel layout of a frame. `code()` is the stable integer surfaced to
/// downstream encoders; `Unknown` (0) is reported until a camera reaches its
/// streaming state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Unknown,
    /// Packed 8-bit RGB, 3 bytes per pixel.
    Rgb24,
    /// Single-channel 8-bit, used for motion masks.
    Gray8,
}

impl PixelFormat {
    pub fn code(self) -> i32 {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::Rgb24 => 1,
            PixelFormat::Gray8 => 2,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One decoded image. Producers build it once and publish it; after that the
/// pixels are never mutated.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Arc<[u8]>,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(format.bytes_per_pixel()))
            .ok_or_else(|| anyhow!("frame dimensions overflow: {}x{}", width, height))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch for {}x{} {:?}: expected {}, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            format,
            data: data.into(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True when both frames are views of the same pixel snapshot.
    pub fn shares_pixels_with(&self, other: &VideoFrame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
