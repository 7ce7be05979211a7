//! Camera registry.
//!
//! A `CameraSet` owns every camera's grabber and analyzer pair and drives
//! their lifecycle as a group. Cameras are indexed from 1 in registration
//! order, matching how operators number them in config files and logs.

use anyhow::{anyhow, Result};

use crate::config::CameraConfig;
use crate::grabber::{CameraGrabber, GrabberHandle, SourceFactory};
use crate::motion::{AnalyzerHandle, MotionAnalyzer};

/// One registered camera: its config plus the grabber/analyzer pair built
/// from it. The pair exists from registration; threads run only between
/// `start_all` and `stop_all`.
pub struct CameraEntry {
    index: usize,
    grabber: CameraGrabber,
    analyzer: MotionAnalyzer,
}

impl CameraEntry {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &CameraConfig {
        self.grabber.config()
    }

    pub fn frames(&self) -> GrabberHandle {
        self.grabber.handle()
    }

    pub fn motion(&self) -> AnalyzerHandle {
        self.analyzer.handle()
    }

    pub fn is_running(&self) -> bool {
        self.grabber.is_running() || self.analyzer.is_running()
    }
}

/// Owns all cameras. Start order per camera is grabber first so the analyzer
/// never pulls from a dead cache; stop order is the reverse.
#[derive(Default)]
pub struct CameraSet {
    entries: Vec<CameraEntry>,
    output_width: Option<u32>,
}

impl CameraSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output width applied to cameras registered after this call.
    pub fn with_output_width(mut self, width: u32) -> Self {
        self.output_width = Some(width);
        self
    }

    /// Registers a camera and returns its 1-based index.
    pub fn add(&mut self, config: CameraConfig) -> Result<usize> {
        self.add_entry(config, None)
    }

    /// Registers a camera with a custom decode-session factory (tests).
    pub fn add_with_source_factory(
        &mut self,
        config: CameraConfig,
        factory: SourceFactory,
    ) -> Result<usize> {
        self.add_entry(config, Some(factory))
    }

    fn add_entry(
        &mut self,
        config: CameraConfig,
        factory: Option<SourceFactory>,
    ) -> Result<usize> {
        config.validate()?;
        let index = self.entries.len() + 1;
        let mut grabber = CameraGrabber::new(index, config.clone());
        if let Some(width) = self.output_width {
            grabber = grabber.with_output_width(width);
        }
        if let Some(factory) = factory {
            grabber = grabber.with_source_factory(factory);
        }
        let analyzer = MotionAnalyzer::new(index, config.motion_threshold, grabber.handle());
        self.entries.push(CameraEntry {
            index,
            grabber,
            analyzer,
        });
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_index(&self, index: usize) -> Option<&CameraEntry> {
        self.entries.get(index.checked_sub(1)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CameraEntry> {
        self.entries.iter()
    }

    /// Starts every camera, grabber before analyzer. Fails fast on the first
    /// start error; already-started cameras keep running so the caller can
    /// `stop_all` to unwind.
    pub fn start_all(&mut self) -> Result<()> {
        log::info!("starting {} cameras", self.entries.len());
        for entry in &mut self.entries {
            entry.grabber.start()?;
            entry.analyzer.start()?;
        }
        Ok(())
    }

    /// Stops every camera, analyzer before grabber. Best-effort: a stop
    /// failure on one camera never prevents stopping the rest. Idempotent.
    pub fn stop_all(&mut self) -> Result<()> {
        log::info!("stopping {} cameras", self.entries.len());
        let mut failures = 0usize;
        for entry in &mut self.entries {
            if let Err(e) = entry.analyzer.stop() {
                log::warn!("cam{}: analyzer stop failed: {:#}", entry.index, e);
                failures += 1;
            }
            if let Err(e) = entry.grabber.stop() {
                log::warn!("cam{}: grabber stop failed: {:#}", entry.index, e);
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(anyhow!("{} camera worker(s) failed to stop cleanly", failures));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::VideoFrame;
    use crate::source::{StreamInfo, StubSource, VideoSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(url: &str) -> CameraConfig {
        CameraConfig {
            source_url: url.to_string(),
            motion_threshold: 0.3,
        }
    }

    #[test]
    fn cameras_are_indexed_from_one() {
        let mut set = CameraSet::new();
        assert_eq!(set.add(config("stub://a")).unwrap(), 1);
        assert_eq!(set.add(config("stub://b")).unwrap(), 2);
        assert_eq!(set.len(), 2);
        assert_eq!(set.by_index(1).unwrap().config().source_url, "stub://a");
        assert_eq!(set.by_index(2).unwrap().config().source_url, "stub://b");
        assert!(set.by_index(0).is_none());
        assert!(set.by_index(3).is_none());
    }

    #[test]
    fn rejects_an_invalid_camera_config() {
        let mut set = CameraSet::new();
        assert!(set
            .add(CameraConfig {
                source_url: String::new(),
                motion_threshold: 0.3,
            })
            .is_err());
        assert!(set
            .add(CameraConfig {
                source_url: "stub://x".to_string(),
                motion_threshold: 150.0,
            })
            .is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn starts_and_stops_the_whole_set() {
        let mut set = CameraSet::new().with_output_width(160);
        set.add(config("stub://a?w=160&h=90&fps=60")).unwrap();
        set.add(config("stub://b?w=160&h=90&fps=60")).unwrap();
        set.start_all().unwrap();
        assert!(set.iter().all(|e| e.is_running()));

        // Frames flow for every camera.
        for entry in set.iter() {
            let mut got = false;
            for _ in 0..20 {
                if entry
                    .frames()
                    .pull_latest_frame(Duration::from_millis(250))
                    .is_some()
                {
                    got = true;
                    break;
                }
            }
            assert!(got, "cam{} delivered no frame", entry.index());
        }

        set.stop_all().unwrap();
        assert!(set.iter().all(|e| !e.is_running()));
        // Stopping again is a no-op.
        set.stop_all().unwrap();
    }

    /// Source whose grab panics, killing its worker thread.
    struct PanickingSource {
        inner: StubSource,
        grabs: Arc<AtomicUsize>,
    }

    impl VideoSource for PanickingSource {
        fn connect(&mut self) -> anyhow::Result<StreamInfo> {
            self.inner.connect()
        }

        fn grab(&mut self) -> anyhow::Result<Option<VideoFrame>> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            panic!("decoder crashed");
        }

        fn close(&mut self) {}
    }

    #[test]
    fn a_crashed_camera_does_not_block_stopping_the_others() {
        let grabs = Arc::new(AtomicUsize::new(0));
        let factory_grabs = grabs.clone();
        let factory: SourceFactory = Arc::new(move |_url| {
            Ok(Box::new(PanickingSource {
                inner: StubSource::parse("stub://crash?w=160&h=90")?,
                grabs: factory_grabs.clone(),
            }) as Box<dyn VideoSource>)
        });

        let mut set = CameraSet::new().with_output_width(160);
        set.add(config("stub://a?w=160&h=90&fps=60")).unwrap();
        set.add_with_source_factory(config("stub://crash"), factory)
            .unwrap();
        set.add(config("stub://c?w=160&h=90&fps=60")).unwrap();
        set.start_all().unwrap();

        // Wait for camera 2's worker to hit the panic.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while grabs.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(grabs.load(Ordering::SeqCst) > 0, "crash never triggered");

        let result = set.stop_all();
        assert!(result.is_err(), "crashed worker must surface at stop");
        // The healthy cameras stopped despite camera 2's failure.
        assert!(!set.by_index(1).unwrap().is_running());
        assert!(!set.by_index(3).unwrap().is_running());
        // A second stop is clean.
        set.stop_all().unwrap();
    }

    #[test]
    fn frame_pixels_are_shared_not_copied_between_consumers() {
        let mut set = CameraSet::new().with_output_width(160);
        set.add(config("stub://a?w=160&h=90&fps=60")).unwrap();
        set.start_all().unwrap();

        let entry = set.by_index(1).unwrap();
        let mut first = None;
        for _ in 0..20 {
            first = entry.frames().pull_latest_frame(Duration::from_millis(250));
            if first.is_some() {
                break;
            }
        }
        let first = first.expect("no frame");
        let again = entry.frames().latest_frame().expect("cache lost the frame");
        assert!(first.shares_pixels_with(&again));

        set.stop_all().unwrap();
    }
}
