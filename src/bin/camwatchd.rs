//! camwatchd - multi-camera motion watch daemon
//!
//! Loads the camera list from a JSON config file (or `CAMWATCH_*` environment
//! variables), starts a grabber/analyzer pair per camera, and polls each
//! camera's motion flag, logging detections until interrupted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use camwatch::runner::QuitToken;
use camwatch::{CameraConfig, CameraSet, CamwatchConfig};

#[derive(Parser, Debug)]
#[command(name = "camwatchd", version, about = "Multi-camera motion watch daemon")]
struct Args {
    /// Path to the JSON config file.
    #[arg(long, env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Camera source URL with the default threshold; repeat for several
    /// cameras. Replaces the configured camera list.
    #[arg(long = "camera", value_name = "URL")]
    cameras: Vec<String>,

    /// Output frame width in pixels; height follows the 16:9 aspect.
    #[arg(long)]
    width: Option<u32>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,

    /// Milliseconds between motion polls.
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Seconds between status log lines, 0 to disable.
    #[arg(long, default_value_t = 30)]
    status_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut cfg = match &args.config {
        Some(path) => CamwatchConfig::load_from(path)?,
        None => CamwatchConfig::load()?,
    };
    if !args.cameras.is_empty() {
        cfg.cameras = args.cameras.iter().map(CameraConfig::for_url).collect();
    }
    if let Some(width) = args.width {
        cfg.output_width = width;
    }
    cfg.validate()?;
    log::info!(
        "camwatchd {} with {} camera(s), output width {}",
        env!("CARGO_PKG_VERSION"),
        cfg.cameras.len(),
        cfg.output_width
    );

    let mut cameras = CameraSet::new().with_output_width(cfg.output_width);
    for camera in &cfg.cameras {
        let index = cameras.add(camera.clone())?;
        log::info!(
            "cam{}: {} (threshold {:.2})",
            index,
            camera.source_url,
            camera.motion_threshold
        );
    }

    if let Err(e) = cameras.start_all() {
        // Unwind whatever did come up before bailing.
        let _ = cameras.stop_all();
        return Err(e);
    }

    let quit = QuitToken::new();
    let handler_quit = quit.clone();
    ctrlc::set_handler(move || {
        log::info!("interrupt received, shutting down");
        handler_quit.set();
    })?;

    let poll_ms = args.poll_ms.max(10) as i64;
    let status_every = args
        .status_secs
        .checked_mul(1000)
        .filter(|&ms| ms > 0)
        .map(|ms| ms as i64);
    let mut next_status = status_every;

    let mut elapsed: i64 = 0;
    while !quit.is_set() {
        quit.sleep_ms(poll_ms);
        elapsed += poll_ms;

        for entry in cameras.iter() {
            if entry.motion().take_motion_detected() {
                log::info!(
                    "cam{}: MOTION, foreground {:.1}%",
                    entry.index(),
                    entry.motion().noise_percent()
                );
            }
        }

        if let Some(every) = status_every {
            if elapsed >= next_status.unwrap_or(i64::MAX) {
                for entry in cameras.iter() {
                    let frames = entry.frames();
                    log::info!(
                        "cam{}: source {:.1} fps ({:?}), grabbing at {:.1} fps, score {:.1}%",
                        entry.index(),
                        frames.source_frame_rate(),
                        frames.source_pixel_format(),
                        frames.measured_fps(),
                        entry.motion().noise_percent()
                    );
                }
                next_status = Some(elapsed + every);
            }
        }
    }

    cameras.stop_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_width_and_verbose_flags_parse() {
        let args = Args::try_parse_from([
            "camwatchd",
            "--camera",
            "stub://front",
            "--camera",
            "stub://back",
            "--width",
            "320",
            "--verbose",
        ])
        .unwrap();
        assert_eq!(args.cameras, ["stub://front", "stub://back"]);
        assert_eq!(args.width, Some(320));
        assert!(args.verbose);
        assert!(args.config.is_none());
    }

    #[test]
    fn flags_default_to_the_config_file_settings() {
        let args = Args::try_parse_from(["camwatchd"]).unwrap();
        assert!(args.cameras.is_empty());
        assert_eq!(args.width, None);
        assert!(!args.verbose);
        assert_eq!(args.poll_ms, 500);
        assert_eq!(args.status_secs, 30);
    }
}
