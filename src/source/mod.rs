//! Video decode sessions.
//!
//! A `VideoSource` is one connection to a camera feed: connect, grab frames,
//! close. Sources are exclusively owned by their grabber thread and are never
//! shared.
//!
//! Two backends exist:
//! - `stub://` URLs open a `StubSource`, a synthetic feed with a moving block
//!   (always available, used by tests and demos),
//! - anything else opens a GStreamer session (feature `rtsp-gstreamer`).

use anyhow::Result;

pub mod stub;

#[cfg(feature = "rtsp-gstreamer")]
pub mod gst;

pub use stub::StubSource;

#[cfg(feature = "rtsp-gstreamer")]
pub use gst::GstSource;

use crate::frame::{PixelFormat, VideoFrame};

/// Properties of a connected stream, read once at connect time.
#[derive(Clone, Copy, Debug)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// Native frame rate, or 0 when the source does not report one.
    pub frame_rate: f64,
    pub pixel_format: PixelFormat,
}

/// One decode session against a camera URL.
///
/// `grab` blocks only up to the session's own read timeout; `Ok(None)` means
/// end of stream. After an error or EOS the session is done — the owner
/// closes it and opens a fresh one.
pub trait VideoSource: Send {
    fn connect(&mut self) -> Result<StreamInfo>;

    fn grab(&mut self) -> Result<Option<VideoFrame>>;

    fn close(&mut self);
}

/// Opens the backend matching the URL scheme.
pub fn open_source(url: &str) -> Result<Box<dyn VideoSource>> {
    if url.starts_with(stub::STUB_PREFIX) {
        return Ok(Box::new(StubSource::parse(url)?));
    }
    #[cfg(feature = "rtsp-gstreamer")]
    {
        Ok(Box::new(GstSource::new(url)?))
    }
    #[cfg(not(feature = "rtsp-gstreamer"))]
    {
        anyhow::bail!(
            "source '{}' requires the rtsp-gstreamer feature (only stub:// is built in)",
            url
        )
    }
}
