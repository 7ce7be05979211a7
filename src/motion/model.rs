//! Background subtraction.
//!
//! A `BackgroundModel` learns what the static scene looks like and classifies
//! each pixel of incoming frames as background or foreground. The in-crate
//! `AdaptiveMeanModel` keeps a per-pixel running mean and variance in
//! grayscale; a pixel is foreground when its squared distance from the mean
//! exceeds `var_threshold` times the learned variance.

use anyhow::{anyhow, Result};

use crate::frame::{PixelFormat, VideoFrame};

/// Tuning for background learning, matching common surveillance defaults.
#[derive(Clone, Copy, Debug)]
pub struct BackgroundParams {
    /// Frames of history the model adapts over; the learning rate settles at
    /// `1 / history` once that many frames have been seen.
    pub history: u32,
    /// Squared-Mahalanobis-distance threshold for calling a pixel foreground.
    pub var_threshold: f64,
    /// Whether to classify shadows separately. Not implemented by the
    /// in-crate model; kept so external models can honor it.
    pub detect_shadows: bool,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            history: 500,
            var_threshold: 16.0,
            detect_shadows: false,
        }
    }
}

/// Binary foreground mask, one byte per pixel, 255 = foreground.
#[derive(Clone, Debug)]
pub struct ForegroundMask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ForegroundMask {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if data.len() != (width as usize) * (height as usize) {
            return Err(anyhow!(
                "mask buffer is {} bytes, expected {}",
                data.len(),
                (width as usize) * (height as usize)
            ));
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Fraction of foreground pixels, in `0.0..=1.0`.
    pub fn foreground_fraction(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let set = self.data.iter().filter(|&&p| p != 0).count();
        set as f64 / self.data.len() as f64
    }
}

/// Scene model fed one frame per analyzer tick. Owned by a single analyzer
/// thread, so implementations keep mutable state freely.
pub trait BackgroundModel: Send {
    /// Learns from `frame` and returns its foreground mask.
    fn apply(&mut self, frame: &VideoFrame) -> Result<ForegroundMask>;

    /// Forgets the learned scene; the next frame starts a fresh model.
    fn reset(&mut self);
}

/// Per-pixel running mean and variance over grayscale intensity.
pub struct AdaptiveMeanModel {
    params: BackgroundParams,
    width: u32,
    height: u32,
    means: Vec<f32>,
    variances: Vec<f32>,
    frames_seen: u32,
}

/// Floor on the learned variance so a perfectly still scene does not flag
/// every sensor-noise flicker as foreground.
const MIN_VARIANCE: f32 = 4.0;

/// Variance assigned to pixels of the very first frame.
const INITIAL_VARIANCE: f32 = 225.0;

impl AdaptiveMeanModel {
    pub fn new(params: BackgroundParams) -> Self {
        Self {
            params,
            width: 0,
            height: 0,
            means: Vec::new(),
            variances: Vec::new(),
            frames_seen: 0,
        }
    }

    fn luma(frame: &VideoFrame, out: &mut Vec<f32>) -> Result<()> {
        out.clear();
        match frame.format() {
            PixelFormat::Gray8 => out.extend(frame.data().iter().map(|&p| p as f32)),
            PixelFormat::Rgb24 => out.extend(frame.data().chunks_exact(3).map(|px| {
                0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32
            })),
            other => return Err(anyhow!("cannot model {:?} frames", other)),
        }
        Ok(())
    }
}

impl BackgroundModel for AdaptiveMeanModel {
    fn apply(&mut self, frame: &VideoFrame) -> Result<ForegroundMask> {
        let mut gray = Vec::new();
        Self::luma(frame, &mut gray)?;

        if frame.width() != self.width || frame.height() != self.height {
            // Geometry change (new session, new crop) restarts learning.
            self.width = frame.width();
            self.height = frame.height();
            self.frames_seen = 0;
        }

        if self.frames_seen == 0 {
            self.means = gray.clone();
            self.variances = vec![INITIAL_VARIANCE; gray.len()];
            self.frames_seen = 1;
            let mask = vec![0u8; gray.len()];
            return ForegroundMask::new(self.width, self.height, mask);
        }

        self.frames_seen = self.frames_seen.saturating_add(1);
        let rate = 1.0 / self.frames_seen.min(self.params.history.max(1)) as f32;
        let threshold = self.params.var_threshold as f32;

        let mut mask = vec![0u8; gray.len()];
        for (i, &g) in gray.iter().enumerate() {
            let mean = &mut self.means[i];
            let var = &mut self.variances[i];
            let d = g - *mean;
            if d * d > threshold * *var {
                mask[i] = 255;
            }
            *mean += rate * d;
            *var = (*var + rate * (d * d - *var)).max(MIN_VARIANCE);
        }
        ForegroundMask::new(self.width, self.height, mask)
    }

    fn reset(&mut self) {
        self.frames_seen = 0;
    }
}
