//! GStreamer decode session for real camera URLs.
//!
//! RTSP URLs get an `rtspsrc ! decodebin` front end with a bounded TCP
//! timeout; anything else goes through `uridecodebin`. Both converge on
//! `videoconvert ! video/x-raw,format=RGB ! appsink` so the rest of the
//! pipeline only ever sees packed RGB.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use crate::frame::{PixelFormat, VideoFrame};
use crate::source::{StreamInfo, VideoSource};

/// Connect and per-sample read deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GstSource {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    /// First frame decoded while probing caps at connect time.
    pending: Option<VideoFrame>,
    saw_eos: bool,
}

impl GstSource {
    pub fn new(url: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let front = if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            // Timeout is in microseconds, matching the ffmpeg stimeout knob.
            format!(
                "rtspsrc location={} latency=0 tcp-timeout={} ! decodebin",
                url,
                READ_TIMEOUT.as_micros()
            )
        } else {
            format!("uridecodebin uri={}", url)
        };
        let description = format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            front
        );
        let pipeline = gstreamer::parse_launch(&description)
            .with_context(|| format!("build decode pipeline for {}", url))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("decode pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            pending: None,
            saw_eos: false,
        })
    }

    fn read_timeout() -> gstreamer::ClockTime {
        gstreamer::ClockTime::from_mseconds(READ_TIMEOUT.as_millis() as u64)
    }

    /// Drains pipeline bus messages; returns an error for a fatal stream
    /// error, and flags EOS.
    fn poll_bus(&mut self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "stream error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.saw_eos = true;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn pull_frame(&mut self) -> Result<Option<(VideoFrame, f64)>> {
        self.poll_bus()?;
        if self.saw_eos {
            return Ok(None);
        }
        let Some(sample) = self.appsink.try_pull_sample(Self::read_timeout()) else {
            // Distinguish a quiet EOS from a stalled link.
            self.poll_bus()?;
            if self.saw_eos || self.appsink.is_eos() {
                return Ok(None);
            }
            return Err(anyhow!("stream stalled: no sample within {:?}", READ_TIMEOUT));
        };

        let buffer = sample.buffer().context("sample missing buffer")?;
        let caps = sample.caps().context("sample missing caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps")?;

        let width = info.width();
        let height = info.height();
        let fps = info.fps();
        let frame_rate = if fps.denom() > 0 {
            fps.numer() as f64 / fps.denom() as f64
        } else {
            0.0
        };

        let row_bytes = width as usize * 3;
        let stride = info.stride()[0] as usize;
        let map = buffer.map_readable().context("map sample buffer")?;
        let data = map.as_slice();

        let pixels = if stride == row_bytes {
            data.get(..row_bytes * height as usize)
                .context("sample buffer too short")?
                .to_vec()
        } else {
            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                pixels.extend_from_slice(
                    data.get(start..start + row_bytes)
                        .context("sample row out of bounds")?,
                );
            }
            pixels
        };

        let frame = VideoFrame::new(width, height, PixelFormat::Rgb24, pixels)?;
        Ok(Some((frame, frame_rate)))
    }
}

impl VideoSource for GstSource {
    fn connect(&mut self) -> Result<StreamInfo> {
        self.saw_eos = false;
        self.pending = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start decode pipeline for {}", self.url))?;

        // Pull the first frame to learn the negotiated geometry and rate.
        let (frame, frame_rate) = self
            .pull_frame()?
            .ok_or_else(|| anyhow!("stream ended before the first frame: {}", self.url))?;
        let info = StreamInfo {
            width: frame.width(),
            height: frame.height(),
            frame_rate,
            pixel_format: PixelFormat::Rgb24,
        };
        self.pending = Some(frame);
        log::info!(
            "connected to {}: {}x{} @ {} fps",
            self.url,
            info.width,
            info.height,
            info.frame_rate
        );
        Ok(info)
    }

    fn grab(&mut self) -> Result<Option<VideoFrame>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        Ok(self.pull_frame()?.map(|(frame, _rate)| frame))
    }

    fn close(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("tearing down pipeline for {}: {}", self.url, e);
        }
    }
}
