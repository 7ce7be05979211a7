//! Synthetic camera feed for tests and camera-less demos.
//!
//! A `stub://` URL produces RGB frames of a static gradient background with a
//! bright block wandering across it, plus a little per-pixel sensor noise.
//! Query parameters tune the feed:
//!
//! `stub://yard?w=640&h=360&fps=10&speed=4&eos_after=100`
//!
//! - `w`/`h`: frame geometry (default 640x360)
//! - `fps`: reported native frame rate (default 10)
//! - `speed`: block movement in pixels per frame; 0 keeps the scene still
//! - `eos_after`: end the stream after N frames per session (0 = never)

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::frame::{PixelFormat, VideoFrame};
use crate::source::{StreamInfo, VideoSource};

pub const STUB_PREFIX: &str = "stub://";

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 360;
const DEFAULT_FPS: f64 = 10.0;
const DEFAULT_SPEED: u32 = 4;
const BLOCK_SIZE: u32 = 64;
const NOISE_AMPLITUDE: u8 = 2;

pub struct StubSource {
    width: u32,
    height: u32,
    frame_rate: f64,
    speed: u32,
    eos_after: u64,
    x: u32,
    y: u32,
    session_frames: u64,
    rng: StdRng,
}

impl StubSource {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(STUB_PREFIX)
            .ok_or_else(|| anyhow!("not a stub url: {}", url))?;
        let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");

        let mut source = Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            frame_rate: DEFAULT_FPS,
            speed: DEFAULT_SPEED,
            eos_after: 0,
            x: 0,
            y: 0,
            session_frames: 0,
            rng: StdRng::from_entropy(),
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter '{}' in {}", pair, url))?;
            match key {
                "w" => source.width = parse_num(key, value)?,
                "h" => source.height = parse_num(key, value)?,
                "fps" => {
                    source.frame_rate = value
                        .parse()
                        .with_context(|| format!("stub parameter fps='{}'", value))?
                }
                "speed" => source.speed = parse_num(key, value)?,
                "eos_after" => source.eos_after = parse_num(key, value)?,
                other => return Err(anyhow!("unknown stub parameter '{}' in {}", other, url)),
            }
        }
        if source.width == 0 || source.height == 0 {
            return Err(anyhow!("stub geometry must be non-zero: {}", url));
        }
        Ok(source)
    }

    fn render(&mut self) -> Result<VideoFrame> {
        let w = self.width;
        let h = self.height;
        let mut data = vec![0u8; (w * h * 3) as usize];

        for row in 0..h {
            for col in 0..w {
                let in_block = self.speed > 0
                    && col >= self.x
                    && col < (self.x + BLOCK_SIZE).min(w)
                    && row >= self.y
                    && row < (self.y + BLOCK_SIZE).min(h);
                let base = if in_block {
                    230
                } else {
                    // Static diagonal gradient background.
                    (40 + ((col + row) % 64)) as u8
                };
                let noise: i16 = self.rng.gen_range(-(NOISE_AMPLITUDE as i16)..=NOISE_AMPLITUDE as i16);
                let value = (base as i16 + noise).clamp(0, 255) as u8;
                let offset = ((row * w + col) * 3) as usize;
                data[offset] = value;
                data[offset + 1] = value;
                data[offset + 2] = value;
            }
        }

        // Advance the block for the next frame, wrapping at the edges.
        if self.speed > 0 {
            self.x += self.speed;
            self.y += self.speed / 2;
            if self.x + BLOCK_SIZE > w {
                self.x = 0;
                self.y += self.speed;
            }
            if self.y + BLOCK_SIZE > h {
                self.y = 0;
            }
        }

        VideoFrame::new(w, h, PixelFormat::Rgb24, data)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter {}='{}' is not a number", key, value))
}

impl VideoSource for StubSource {
    fn connect(&mut self) -> Result<StreamInfo> {
        self.session_frames = 0;
        log::debug!(
            "stub source connected: {}x{} @ {} fps",
            self.width,
            self.height,
            self.frame_rate
        );
        Ok(StreamInfo {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            pixel_format: PixelFormat::Rgb24,
        })
    }

    fn grab(&mut self) -> Result<Option<VideoFrame>> {
        if self.eos_after > 0 && self.session_frames >= self.eos_after {
            return Ok(None);
        }
        self.session_frames += 1;
        self.render().map(Some)
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_parameters() {
        let source = StubSource::parse("stub://yard?w=320&h=180&fps=25&speed=0&eos_after=7").unwrap();
        assert_eq!(source.width, 320);
        assert_eq!(source.height, 180);
        assert_eq!(source.frame_rate, 25.0);
        assert_eq!(source.speed, 0);
        assert_eq!(source.eos_after, 7);
    }

    #[test]
    fn defaults_apply_without_query() {
        let source = StubSource::parse("stub://front").unwrap();
        assert_eq!(source.width, DEFAULT_WIDTH);
        assert_eq!(source.height, DEFAULT_HEIGHT);
        assert_eq!(source.frame_rate, DEFAULT_FPS);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(StubSource::parse("stub://a?w=abc").is_err());
        assert!(StubSource::parse("stub://a?bogus=1").is_err());
        assert!(StubSource::parse("stub://a?w=0").is_err());
        assert!(StubSource::parse("rtsp://a").is_err());
    }

    #[test]
    fn produces_rgb_frames_with_declared_geometry() {
        let mut source = StubSource::parse("stub://a?w=64&h=36").unwrap();
        let info = source.connect().unwrap();
        assert_eq!(info.pixel_format, PixelFormat::Rgb24);

        let frame = source.grab().unwrap().unwrap();
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 36);
        assert_eq!(frame.data().len(), 64 * 36 * 3);
    }

    #[test]
    fn moving_block_changes_the_scene() {
        let mut source = StubSource::parse("stub://a?w=128&h=72&speed=8").unwrap();
        source.connect().unwrap();
        let a = source.grab().unwrap().unwrap();
        let b = source.grab().unwrap().unwrap();
        let differing = a
            .data()
            .iter()
            .zip(b.data())
            .filter(|(x, y)| {
                let d = (**x as i16 - **y as i16).abs();
                d > (2 * NOISE_AMPLITUDE) as i16
            })
            .count();
        assert!(differing > 100, "block did not move: {} differing bytes", differing);
    }

    #[test]
    fn ends_stream_after_configured_frames() {
        let mut source = StubSource::parse("stub://a?w=16&h=9&eos_after=2").unwrap();
        source.connect().unwrap();
        assert!(source.grab().unwrap().is_some());
        assert!(source.grab().unwrap().is_some());
        assert!(source.grab().unwrap().is_none());

        // A fresh session starts over.
        source.connect().unwrap();
        assert!(source.grab().unwrap().is_some());
    }
}
