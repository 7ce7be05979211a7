//! Frame-rate pacing and measurement for the per-camera loops.
//!
//! Every loop in the pipeline brackets its iteration with `start_tick` /
//! `end_wait`: the first measures the rate actually achieved, the second
//! sleeps out whatever slack is left in the iteration budget.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};

/// Drop-in pacer for a rate-controlled loop.
///
/// Given a target frame rate, `end_wait` pauses at the bottom of the loop to
/// stretch the iteration to the target period (if there is any time left),
/// and `start_tick` computes the rate actually achieved by the previous
/// iteration.
pub struct FramePacer {
    clock: Arc<dyn Clock>,
    loop_ms: i64,
    last_ms: Option<i64>,
    fps: f64,
}

impl FramePacer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            loop_ms: 0,
            last_ms: None,
            fps: 0.0,
        }
    }

    /// Pacer on the wall clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }

    /// Sets the target frame rate. Zero or negative means unpaced: `end_wait`
    /// never sleeps.
    pub fn set_frame_rate(&mut self, frame_rate: f64) {
        self.loop_ms = if frame_rate <= 0.0 {
            0
        } else {
            (1000.0 / frame_rate).round() as i64
        };
    }

    /// Loop period in milliseconds needed to achieve the target frame rate.
    pub fn loop_ms(&self) -> i64 {
        self.loop_ms
    }

    /// Rate achieved by the last completed iteration. Updated by `start_tick`;
    /// zero until one full iteration has elapsed.
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Called at the very beginning of a loop iteration.
    pub fn start_tick(&mut self) {
        let now = self.clock.elapsed_ms();
        if let Some(last) = self.last_ms {
            let delta = now - last;
            if delta > 0 {
                self.fps = 1000.0 / delta as f64;
            }
        }
        self.last_ms = Some(now);
    }

    /// Called at the very end of a loop iteration. Sleeps out any remaining
    /// slack and returns the signed slack in milliseconds; a negative value
    /// means the iteration overran its budget and nothing was slept.
    pub fn end_wait(&mut self) -> i64 {
        let Some(last) = self.last_ms else {
            return 0;
        };
        let slack = self.loop_ms - (self.clock.elapsed_ms() - last);
        if slack > 0 {
            self.clock.sleep_ms(slack);
        }
        slack
    }

    /// Forgets the last tick, for reuse after a pause.
    pub fn reset(&mut self) {
        self.last_ms = None;
    }
}
