use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

const DEFAULT_CAMERA_URL: &str = "stub://camera1";
const DEFAULT_MOTION_THRESHOLD: f64 = 0.3;
const DEFAULT_OUTPUT_WIDTH: u32 = 640;
const MIN_OUTPUT_WIDTH: u32 = 16;

#[derive(Debug, Deserialize, Default)]
struct CamwatchConfigFile {
    output_width: Option<u32>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    motion_threshold: Option<f64>,
}

/// One camera as the operator configured it.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub source_url: String,
    /// Minimum foreground percentage of a frame that counts as motion, in
    /// 0..=100. The default of 0.3 means 0.3% of the pixels.
    pub motion_threshold: f64,
}

impl CameraConfig {
    /// A camera on `url` with the default motion threshold.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            source_url: url.into(),
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_url.trim().is_empty() {
            return Err(anyhow!("camera url must not be empty"));
        }
        if !self.motion_threshold.is_finite()
            || !(0.0..=100.0).contains(&self.motion_threshold)
        {
            return Err(anyhow!(
                "motion threshold {} for {} must be a percentage between 0 and 100",
                self.motion_threshold,
                self.source_url
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CamwatchConfig {
    pub output_width: u32,
    pub cameras: Vec<CameraConfig>,
}

impl CamwatchConfig {
    /// Loads from the file named by `CAMWATCH_CONFIG` (defaults apply when
    /// unset), then applies `CAMWATCH_*` environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads from an explicit path, still honoring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Result<Self> {
        let output_width = file.output_width.unwrap_or(DEFAULT_OUTPUT_WIDTH);
        let cameras = match file.cameras {
            None => vec![CameraConfig {
                source_url: DEFAULT_CAMERA_URL.to_string(),
                motion_threshold: DEFAULT_MOTION_THRESHOLD,
            }],
            Some(entries) => entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| {
                    let source_url = entry
                        .url
                        .ok_or_else(|| anyhow!("camera {}: url is required", i + 1))?;
                    Ok(CameraConfig {
                        source_url,
                        motion_threshold: entry
                            .motion_threshold
                            .unwrap_or(DEFAULT_MOTION_THRESHOLD),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(Self {
            output_width,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(urls) = std::env::var("CAMWATCH_CAMERA_URLS") {
            let parsed = split_csv(&urls);
            if !parsed.is_empty() {
                self.cameras = parsed.into_iter().map(CameraConfig::for_url).collect();
            }
        }
        if let Ok(threshold) = std::env::var("CAMWATCH_MOTION_THRESHOLD") {
            let threshold: f64 = threshold.parse().map_err(|_| {
                anyhow!("CAMWATCH_MOTION_THRESHOLD must be a percentage between 0 and 100")
            })?;
            for camera in &mut self.cameras {
                camera.motion_threshold = threshold;
            }
        }
        if let Ok(width) = std::env::var("CAMWATCH_OUTPUT_WIDTH") {
            self.output_width = width
                .parse()
                .map_err(|_| anyhow!("CAMWATCH_OUTPUT_WIDTH must be an integer"))?;
        }
        Ok(())
    }

    /// Checks the assembled configuration; callers that override fields after
    /// loading run this again.
    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        if self.output_width < MIN_OUTPUT_WIDTH {
            return Err(anyhow!(
                "output width {} is below the minimum of {}",
                self.output_width,
                MIN_OUTPUT_WIDTH
            ));
        }
        for camera in &self.cameras {
            camera.validate()?;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_give_one_stub_camera() {
        let cfg = CamwatchConfig::from_file(CamwatchConfigFile::default()).unwrap();
        assert_eq!(cfg.output_width, DEFAULT_OUTPUT_WIDTH);
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].source_url, DEFAULT_CAMERA_URL);
        assert_eq!(cfg.cameras[0].motion_threshold, DEFAULT_MOTION_THRESHOLD);
    }

    #[test]
    fn parses_a_full_config_file() {
        let file: CamwatchConfigFile = serde_json::from_str(
            r#"{
                "output_width": 320,
                "cameras": [
                    {"url": "rtsp://cam1.local/stream", "motion_threshold": 0.2},
                    {"url": "stub://backyard"}
                ]
            }"#,
        )
        .unwrap();
        let cfg = CamwatchConfig::from_file(file).unwrap();
        assert_eq!(cfg.output_width, 320);
        assert_eq!(cfg.cameras.len(), 2);
        assert_eq!(cfg.cameras[0].source_url, "rtsp://cam1.local/stream");
        assert_eq!(cfg.cameras[0].motion_threshold, 0.2);
        assert_eq!(cfg.cameras[1].motion_threshold, DEFAULT_MOTION_THRESHOLD);
    }

    #[test]
    fn a_camera_without_a_url_is_rejected() {
        let file: CamwatchConfigFile =
            serde_json::from_str(r#"{"cameras": [{"motion_threshold": 0.4}]}"#).unwrap();
        assert!(CamwatchConfig::from_file(file).is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_thresholds() {
        let camera = CameraConfig {
            source_url: "stub://x".to_string(),
            motion_threshold: 150.0,
        };
        assert!(camera.validate().is_err());
        let camera = CameraConfig {
            source_url: "stub://x".to_string(),
            motion_threshold: -0.1,
        };
        assert!(camera.validate().is_err());
        let camera = CameraConfig {
            source_url: "stub://x".to_string(),
            motion_threshold: f64::NAN,
        };
        assert!(camera.validate().is_err());

        // Percent values above 1 are legitimate thresholds.
        let camera = CameraConfig {
            source_url: "stub://x".to_string(),
            motion_threshold: 5.0,
        };
        assert!(camera.validate().is_ok());
    }

    #[test]
    fn validation_rejects_an_empty_camera_list() {
        let cfg = CamwatchConfig {
            output_width: 640,
            cameras: Vec::new(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_a_tiny_output_width() {
        let cfg = CamwatchConfig {
            output_width: 8,
            cameras: vec![CameraConfig {
                source_url: "stub://x".to_string(),
                motion_threshold: 0.3,
            }],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn csv_splitting_trims_and_drops_empties() {
        assert_eq!(
            split_csv(" stub://a , ,stub://b,"),
            vec!["stub://a".to_string(), "stub://b".to_string()]
        );
        assert!(split_csv("").is_empty());
    }
}
