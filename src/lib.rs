//! camwatch
//!
//! Core pipeline for multi-camera motion detection. Each configured camera
//! gets two cooperating threads:
//!
//! - a **grabber** that keeps a decode session alive against the camera URL,
//!   reconnecting aggressively on any failure, and publishes normalized
//!   16:9 frames on demand;
//! - an **analyzer** that pulls frames at a reduced rate, runs background
//!   subtraction and mask denoising, and latches a consume-once motion flag
//!   when the foreground fraction crosses the camera's threshold.
//!
//! The two are decoupled by a single-slot frame cache with a pull protocol:
//! consumers request a fresh frame and wait with a bounded timeout, and the
//! grabber only pays for crop-and-resize when someone is actually waiting.
//!
//! # Module Structure
//!
//! - `clock`: time source abstraction so pacing is testable
//! - `pacing`: frame-rate pacing and achieved-fps measurement
//! - `runner`: worker-thread lifecycle (spawn, quit token, join)
//! - `frame`, `cache`: video frames and the single-slot pull cache
//! - `source`: decode sessions (`stub://` synthetic feed, GStreamer RTSP)
//! - `grabber`, `motion`: the per-camera thread pair
//! - `cameras`: the registry driving all pairs as a group
//! - `config`: JSON config file plus `CAMWATCH_*` environment overrides

pub mod cache;
pub mod cameras;
pub mod clock;
pub mod config;
pub mod frame;
pub mod grabber;
pub mod motion;
pub mod pacing;
pub mod runner;
pub mod source;

pub use cache::FrameCache;
pub use cameras::{CameraEntry, CameraSet};
pub use config::{CameraConfig, CamwatchConfig};
pub use frame::{PixelFormat, VideoFrame};
pub use grabber::{CameraGrabber, GrabberHandle};
pub use motion::{AnalyzerHandle, MotionAnalyzer};
pub use pacing::FramePacer;
pub use runner::{LoopRunner, LoopTask, QuitToken};
pub use source::{StreamInfo, VideoSource};
