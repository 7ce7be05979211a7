//! Per-camera frame acquisition.
//!
//! Each `CameraGrabber` owns one worker thread that keeps a decode session
//! alive against the camera URL, grabs frames at the source's native rate,
//! and publishes normalized output frames into its `FrameCache` whenever a
//! consumer has a pull request outstanding.
//!
//! Camera links are assumed to be flaky: any decode error or end-of-stream
//! tears the session down and reconnects immediately, with no backoff beyond
//! the connect timeout itself. The grabber runs unattended indefinitely.

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::FrameCache;
use crate::config::CameraConfig;
use crate::frame::{PixelFormat, VideoFrame};
use crate::pacing::FramePacer;
use crate::runner::{LoopRunner, LoopTask, QuitToken};
use crate::source::{open_source, StreamInfo, VideoSource};

/// All output frames are cropped to this aspect ratio.
const OUTPUT_ASPECT_RATIO: f64 = 16.0 / 9.0;

/// Default output frame width; height follows from the fixed aspect ratio.
pub const DEFAULT_OUTPUT_WIDTH: u32 = 640;

/// Streaming-loop pacing when the source does not report a frame rate.
const DEFAULT_SOURCE_FPS: f64 = 30.0;

/// Opens a decode session for a camera URL. Swappable so tests can script
/// connection failures and frame contents.
pub type SourceFactory = Arc<dyn Fn(&str) -> Result<Box<dyn VideoSource>> + Send + Sync>;

pub(crate) struct GrabberShared {
    cache: FrameCache,
    frame_rate_bits: AtomicU64,
    measured_fps_bits: AtomicU64,
    pixel_format_code: AtomicI32,
}

impl GrabberShared {
    fn new() -> Self {
        Self {
            cache: FrameCache::new(),
            frame_rate_bits: AtomicU64::new(0f64.to_bits()),
            measured_fps_bits: AtomicU64::new(0f64.to_bits()),
            pixel_format_code: AtomicI32::new(PixelFormat::Unknown.code()),
        }
    }

    fn set_stream_info(&self, info: &StreamInfo) {
        self.frame_rate_bits
            .store(info.frame_rate.to_bits(), Ordering::Release);
        self.pixel_format_code
            .store(info.pixel_format.code(), Ordering::Release);
    }

    fn set_measured_fps(&self, fps: f64) {
        self.measured_fps_bits.store(fps.to_bits(), Ordering::Release);
    }
}

/// Cheap cloneable view of a grabber, handed to the camera's analyzer and to
/// external consumers (snapshot handlers, display refresh).
#[derive(Clone)]
pub struct GrabberHandle {
    shared: Arc<GrabberShared>,
}

impl GrabberHandle {
    /// Requests a fresh frame and waits up to `timeout` for the grabber to
    /// supply one; on timeout returns the previous frame, or `None` if the
    /// camera has never delivered. Never blocks past `timeout`.
    pub fn pull_latest_frame(&self, timeout: Duration) -> Option<VideoFrame> {
        self.shared.cache.pull_latest(timeout)
    }

    /// Like [`pull_latest_frame`](Self::pull_latest_frame), but also gives up
    /// (returning the stale frame, if any) once `keep_waiting` turns false.
    /// Lets a consumer that is shutting down abandon its wait without having
    /// to ride out the full timeout.
    pub fn pull_latest_frame_while(
        &self,
        timeout: Duration,
        keep_waiting: impl Fn() -> bool,
    ) -> Option<VideoFrame> {
        self.shared.cache.pull_latest_while(timeout, keep_waiting)
    }

    /// The most recently published frame without waiting for a fresh one.
    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.shared.cache.latest()
    }

    /// The source's native frame rate, or 0 until the stream connects.
    pub fn source_frame_rate(&self) -> f64 {
        f64::from_bits(self.shared.frame_rate_bits.load(Ordering::Acquire))
    }

    /// The source's pixel format, `Unknown` until the stream connects.
    pub fn source_pixel_format(&self) -> PixelFormat {
        match self.shared.pixel_format_code.load(Ordering::Acquire) {
            1 => PixelFormat::Rgb24,
            2 => PixelFormat::Gray8,
            _ => PixelFormat::Unknown,
        }
    }

    /// Rate the grab loop actually achieved over its last iteration.
    pub fn measured_fps(&self) -> f64 {
        f64::from_bits(self.shared.measured_fps_bits.load(Ordering::Acquire))
    }
}

#[cfg(test)]
impl GrabberHandle {
    /// A handle with a live frame cache but no grab thread behind it.
    pub(crate) fn detached() -> Self {
        Self {
            shared: Arc::new(GrabberShared::new()),
        }
    }

    /// Pushes a frame straight into the cache, honoring the pull protocol.
    pub(crate) fn publish_for_test(&self, frame: VideoFrame) -> bool {
        self.shared.cache.publish_if_requested(frame)
    }
}

/// Owns the connection to one camera source and the thread that drives it.
pub struct CameraGrabber {
    index: usize,
    config: CameraConfig,
    output_width: u32,
    factory: SourceFactory,
    shared: Arc<GrabberShared>,
    runner: Option<LoopRunner>,
}

impl CameraGrabber {
    pub fn new(index: usize, config: CameraConfig) -> Self {
        Self {
            index,
            config,
            output_width: DEFAULT_OUTPUT_WIDTH,
            factory: Arc::new(|url| open_source(url)),
            shared: Arc::new(GrabberShared::new()),
            runner: None,
        }
    }

    pub fn with_output_width(mut self, width: u32) -> Self {
        self.output_width = width;
        self
    }

    /// Replaces the decode-session factory (used by tests to script sources).
    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn handle(&self) -> GrabberHandle {
        GrabberHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_some()
    }

    /// Spawns the grab loop. A no-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.runner.is_some() {
            return Ok(());
        }
        log::info!("cam{}: starting grabber for {}", self.index, self.config.source_url);
        let task = GrabberTask {
            tag: format!("cam{}-grab", self.index),
            url: self.config.source_url.clone(),
            output_width: self.output_width,
            factory: self.factory.clone(),
            shared: self.shared.clone(),
        };
        self.runner = Some(LoopRunner::spawn(&format!("cam{}-grab", self.index), task)?);
        Ok(())
    }

    /// Stops the grab loop and joins its thread. Any consumer blocked on a
    /// pull is released with the last cached frame (or none). Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut runner) = self.runner.take() else {
            return Ok(());
        };
        log::info!("cam{}: stopping grabber", self.index);
        runner.quit_token().set();
        self.shared.cache.release_waiters();
        runner.stop()
    }

    pub fn pull_latest_frame(&self, timeout: Duration) -> Option<VideoFrame> {
        self.shared.cache.pull_latest(timeout)
    }

    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.shared.cache.latest()
    }

    pub fn source_frame_rate(&self) -> f64 {
        self.handle().source_frame_rate()
    }

    pub fn source_pixel_format(&self) -> PixelFormat {
        self.handle().source_pixel_format()
    }
}

impl Drop for CameraGrabber {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("cam{}: dropping grabber: {:#}", self.index, e);
        }
    }
}

/// Centered crop rectangle forcing the output aspect ratio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CropRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// If the source is narrower than the target ratio, crop vertically and keep
/// full width; if wider, crop horizontally and keep full height.
fn crop_rect(src_w: u32, src_h: u32, dest_ratio: f64) -> CropRect {
    let src_ratio = src_w as f64 / src_h as f64;
    if src_ratio <= dest_ratio {
        let dst_h = ((src_w as f64 / dest_ratio).round() as u32).clamp(1, src_h);
        CropRect {
            x: 0,
            y: (src_h - dst_h) / 2,
            width: src_w,
            height: dst_h,
        }
    } else {
        let dst_w = ((src_h as f64 * dest_ratio).round() as u32).clamp(1, src_w);
        CropRect {
            x: (src_w - dst_w) / 2,
            y: 0,
            width: dst_w,
            height: src_h,
        }
    }
}

/// Crops to the precomputed rectangle and resizes to the output geometry.
fn scale_to_output(frame: &VideoFrame, crop: CropRect, out_w: u32, out_h: u32) -> Result<VideoFrame> {
    if frame.format() != PixelFormat::Rgb24 {
        return Err(anyhow!("cannot scale {:?} frame", frame.format()));
    }
    let img = RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
        .ok_or_else(|| anyhow!("frame buffer does not match its geometry"))?;
    let cropped = imageops::crop_imm(&img, crop.x, crop.y, crop.width, crop.height).to_image();
    let resized = imageops::resize(&cropped, out_w, out_h, FilterType::Triangle);
    VideoFrame::new(out_w, out_h, PixelFormat::Rgb24, resized.into_raw())
}

struct GrabberTask {
    tag: String,
    url: String,
    output_width: u32,
    factory: SourceFactory,
    shared: Arc<GrabberShared>,
}

impl LoopTask for GrabberTask {
    /// One full connect → stream → teardown cycle. Returning (with or without
    /// an error) reconnects on the next iteration; that aggressive retry is
    /// the intended policy for unreliable camera links.
    fn run_iteration(&mut self, quit: &QuitToken) -> Result<()> {
        log::debug!("{}: connecting to {}", self.tag, self.url);
        let mut source = (self.factory)(&self.url)
            .with_context(|| format!("{}: open source {}", self.tag, self.url))?;
        let info = match source.connect() {
            Ok(info) => info,
            Err(e) => {
                source.close();
                return Err(e.context(format!("{}: connect to {}", self.tag, self.url)));
            }
        };
        self.shared.set_stream_info(&info);
        log::info!(
            "{}: streaming {}x{} @ {} fps, format {:?}",
            self.tag,
            info.width,
            info.height,
            info.frame_rate,
            info.pixel_format
        );

        let crop = crop_rect(info.width, info.height, OUTPUT_ASPECT_RATIO);
        let out_w = self.output_width;
        let out_h = (out_w * 9 / 16).max(1);

        let mut pacer = FramePacer::new(quit.clock());
        pacer.set_frame_rate(if info.frame_rate > 0.0 {
            info.frame_rate
        } else {
            DEFAULT_SOURCE_FPS
        });

        let session_result = loop {
            if quit.is_set() {
                break Ok(());
            }
            pacer.start_tick();
            self.shared.set_measured_fps(pacer.fps());

            match source.grab() {
                Ok(Some(frame)) => {
                    // Crop/resize is deferred until somebody actually asked.
                    if self.shared.cache.has_pending_request() {
                        match scale_to_output(&frame, crop, out_w, out_h) {
                            Ok(out) => {
                                self.shared.cache.publish_if_requested(out);
                            }
                            Err(e) => log::warn!("{}: scaling frame: {:#}", self.tag, e),
                        }
                    }
                }
                Ok(None) => {
                    log::info!("{}: end of stream, reconnecting", self.tag);
                    break Ok(());
                }
                Err(e) => {
                    break Err(e.context(format!("{}: decoding {}", self.tag, self.url)));
                }
            }
            pacer.end_wait();
        };

        source.close();
        session_result
    }
}
