//! Motion detection.
//!
//! Each camera pairs its grabber with one `MotionAnalyzer`: a thread that
//! pulls frames at a reduced rate, runs background subtraction, denoises the
//! foreground mask, and latches a motion flag when the foreground percentage
//! reaches the camera's threshold. The flag is consume-once: reading it
//! clears it, so each consumer poll answers "was motion detected since the
//! last poll" and events between polls are never lost.

pub mod filter;
pub mod model;

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::FrameCache;
use crate::frame::{PixelFormat, VideoFrame};
use crate::grabber::GrabberHandle;
use crate::motion::filter::{median_denoise, DENOISE_KERNEL};
use crate::motion::model::{AdaptiveMeanModel, BackgroundModel, BackgroundParams};
use crate::pacing::FramePacer;
use crate::runner::{LoopRunner, LoopTask, QuitToken};

/// Ceiling on the analysis rate. Motion detection does not need every frame,
/// and background subtraction is the expensive step of the pipeline.
pub const ANALYZER_FPS: f64 = 10.0;

/// Frame-pull budget when the loop is unpaced (no target period to derive
/// one from). A paced loop waits its own period instead.
const FALLBACK_PULL_TIMEOUT: Duration = Duration::from_millis(500);

/// Analysis rate for a source running at `source_fps`: a third of the source
/// rate, capped at [`ANALYZER_FPS`], floored at 1 Hz so slow sources still
/// pace their loop. An unknown rate (0) gets the full ceiling.
pub fn effective_target_fps(source_fps: f64) -> f64 {
    if source_fps <= 0.0 {
        return ANALYZER_FPS;
    }
    (source_fps / 3.0).floor().clamp(1.0, ANALYZER_FPS)
}

/// Builds the background model for one analysis session; swappable so tests
/// can script foreground fractions.
pub type ModelFactory = Arc<dyn Fn() -> Box<dyn BackgroundModel> + Send + Sync>;

/// Sliding average over the last N foreground fractions. Window 1 disables
/// smoothing so a single-frame spike still crosses the threshold.
pub struct NoiseWindow {
    size: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl NoiseWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            samples: VecDeque::new(),
            sum: 0.0,
        }
    }

    /// Records a sample and returns the current window average.
    pub fn push(&mut self, sample: f64) -> f64 {
        self.samples.push_back(sample);
        self.sum += sample;
        if self.samples.len() > self.size {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.sum / self.samples.len() as f64
    }
}

struct AnalyzerShared {
    motion_flag: AtomicBool,
    score_bits: AtomicU64,
    mask_cache: FrameCache,
}

impl AnalyzerShared {
    fn new() -> Self {
        Self {
            motion_flag: AtomicBool::new(false),
            score_bits: AtomicU64::new(0f64.to_bits()),
            mask_cache: FrameCache::new(),
        }
    }

    /// Stores the foreground fraction and latches the flag when it reaches
    /// `threshold`, which is a percentage of the frame (0.3 means 0.3% of the
    /// pixels), matching the units the config exposes.
    fn record_score(&self, score: f64, threshold: f64) -> bool {
        self.score_bits.store(score.to_bits(), Ordering::Release);
        if score * 100.0 >= threshold {
            // Latch; only the consumer clears it.
            !self.motion_flag.swap(true, Ordering::AcqRel)
        } else {
            false
        }
    }
}

/// Cloneable view of an analyzer for status polling.
#[derive(Clone)]
pub struct AnalyzerHandle {
    shared: Arc<AnalyzerShared>,
}

impl AnalyzerHandle {
    /// Returns whether motion was detected since the last call, clearing the
    /// flag. With several consumers, exactly one observes each detection.
    pub fn take_motion_detected(&self) -> bool {
        self.shared.motion_flag.swap(false, Ordering::AcqRel)
    }

    /// Foreground fraction of the most recent analyzed frame, `0.0..=1.0`.
    pub fn motion_score(&self) -> f64 {
        f64::from_bits(self.shared.score_bits.load(Ordering::Acquire))
    }

    /// The same score as a percentage, for operator-facing displays.
    pub fn noise_percent(&self) -> f64 {
        self.motion_score() * 100.0
    }

    /// Requests a fresh denoised foreground mask (a `Gray8` frame, 255 =
    /// foreground) and waits up to `timeout`; on timeout, falls back to the
    /// previous mask or `None`. Diagnostic feed, paced at the analysis rate.
    pub fn pull_latest_mask(&self, timeout: Duration) -> Option<VideoFrame> {
        self.shared.mask_cache.pull_latest(timeout)
    }

    /// The most recent mask without waiting for a fresh one.
    pub fn latest_mask(&self) -> Option<VideoFrame> {
        self.shared.mask_cache.latest()
    }
}

/// Runs background subtraction over one camera's frames on its own thread.
pub struct MotionAnalyzer {
    index: usize,
    threshold: f64,
    frames: GrabberHandle,
    shared: Arc<AnalyzerShared>,
    model_factory: ModelFactory,
    window_size: usize,
    runner: Option<LoopRunner>,
}

impl MotionAnalyzer {
    /// `threshold` is the minimum foreground percentage (0..=100) that counts
    /// as motion; frames at exactly the threshold trip it.
    pub fn new(index: usize, threshold: f64, frames: GrabberHandle) -> Self {
        Self {
            index,
            threshold,
            frames,
            shared: Arc::new(AnalyzerShared::new()),
            model_factory: Arc::new(|| {
                Box::new(AdaptiveMeanModel::new(BackgroundParams::default()))
            }),
            window_size: 1,
            runner: None,
        }
    }

    /// Replaces the background-model factory (used by tests).
    pub fn with_model_factory(mut self, factory: ModelFactory) -> Self {
        self.model_factory = factory;
        self
    }

    /// Smooths scores over the last `size` frames before thresholding.
    pub fn with_noise_window(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn handle(&self) -> AnalyzerHandle {
        AnalyzerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn take_motion_detected(&self) -> bool {
        self.handle().take_motion_detected()
    }

    pub fn motion_score(&self) -> f64 {
        self.handle().motion_score()
    }

    pub fn noise_percent(&self) -> f64 {
        self.handle().noise_percent()
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_some()
    }

    /// Spawns the analysis loop. A no-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.runner.is_some() {
            return Ok(());
        }
        log::info!(
            "cam{}: starting analyzer, threshold {:.2}",
            self.index,
            self.threshold
        );
        let task = AnalyzerTask::new(
            format!("cam{}-analyze", self.index),
            self.threshold,
            self.frames.clone(),
            self.shared.clone(),
            (self.model_factory)(),
            self.window_size,
        );
        self.runner = Some(LoopRunner::spawn(
            &format!("cam{}-analyze", self.index),
            task,
        )?);
        Ok(())
    }

    /// Stops the analysis loop and joins its thread. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut runner) = self.runner.take() else {
            return Ok(());
        };
        log::info!("cam{}: stopping analyzer", self.index);
        runner.quit_token().set();
        self.shared.mask_cache.release_waiters();
        runner.stop()
    }
}

impl Drop for MotionAnalyzer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("cam{}: dropping analyzer: {:#}", self.index, e);
        }
    }
}

struct AnalyzerTask {
    tag: String,
    threshold: f64,
    frames: GrabberHandle,
    shared: Arc<AnalyzerShared>,
    model: Box<dyn BackgroundModel>,
    window: NoiseWindow,
    pacer: Option<FramePacer>,
    paced_source_fps: f64,
}

impl AnalyzerTask {
    fn new(
        tag: String,
        threshold: f64,
        frames: GrabberHandle,
        shared: Arc<AnalyzerShared>,
        model: Box<dyn BackgroundModel>,
        window_size: usize,
    ) -> Self {
        Self {
            tag,
            threshold,
            frames,
            shared,
            model,
            window: NoiseWindow::new(window_size),
            pacer: None,
            paced_source_fps: -1.0,
        }
    }

    /// One analysis tick without the loop plumbing, so tests can drive it
    /// deterministically. The pull gives up as soon as `quit` is raised, so
    /// a stopping analyzer never rides out the full pull timeout against a
    /// grabber that is still running.
    fn analyze_once(&mut self, pull_timeout: Duration, quit: &QuitToken) -> Result<()> {
        let pulled = self
            .frames
            .pull_latest_frame_while(pull_timeout, || !quit.is_set());
        if quit.is_set() {
            return Ok(());
        }
        let Some(frame) = pulled else {
            // Nothing to analyze; any latched detection stays latched.
            return Ok(());
        };
        let mask = self.model.apply(&frame)?;
        let denoised = median_denoise(&mask, DENOISE_KERNEL);
        let score = self.window.push(denoised.foreground_fraction());
        if self.shared.record_score(score, self.threshold) {
            log::info!(
                "{}: motion detected, foreground {:.1}%",
                self.tag,
                score * 100.0
            );
        }
        if self.shared.mask_cache.has_pending_request() {
            let (w, h) = (denoised.width(), denoised.height());
            let mask_frame = VideoFrame::new(w, h, PixelFormat::Gray8, denoised.into_data())?;
            self.shared.mask_cache.publish_if_requested(mask_frame);
        }
        Ok(())
    }

    fn pull_timeout(&self) -> Duration {
        match self.pacer.as_ref().map(|p| p.loop_ms()) {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => FALLBACK_PULL_TIMEOUT,
        }
    }
}

impl LoopTask for AnalyzerTask {
    fn on_start(&mut self, quit: &QuitToken) -> Result<()> {
        let mut pacer = FramePacer::new(quit.clock());
        pacer.set_frame_rate(ANALYZER_FPS);
        self.pacer = Some(pacer);
        Ok(())
    }

    fn run_iteration(&mut self, quit: &QuitToken) -> Result<()> {
        let source_fps = self.frames.source_frame_rate();
        if source_fps != self.paced_source_fps {
            // The grabber learned (or re-learned) the source rate; follow it.
            self.paced_source_fps = source_fps;
            let target = effective_target_fps(source_fps);
            if let Some(pacer) = self.pacer.as_mut() {
                pacer.set_frame_rate(target);
            }
            log::info!(
                "{}: analyzing at {} fps for a {} fps source",
                self.tag,
                target,
                source_fps
            );
        }

        if let Some(pacer) = self.pacer.as_mut() {
            pacer.start_tick();
        }
        let result = self.analyze_once(self.pull_timeout(), quit);
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.end_wait();
        }
        result
    }
}
