//! Generic start/stop lifecycle for the dedicated worker threads.
//!
//! Each pipeline loop (one per grabber, one per analyzer) is a `LoopTask`
//! driven by a `LoopRunner`: a thread that calls `run_iteration` until the
//! cooperative quit token is set. Stopping sets the token, which also wakes
//! any pacing sleep taken through the token's clock, then joins the thread.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::clock::Clock;

struct QuitInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
    origin: Instant,
}

/// Cooperative shutdown signal shared between a worker thread and its owner.
#[derive(Clone)]
pub struct QuitToken {
    inner: Arc<QuitInner>,
}

impl QuitToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QuitInner {
                flag: AtomicBool::new(false),
                lock: Mutex::new(()),
                wake: Condvar::new(),
                origin: Instant::now(),
            }),
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.wake.notify_all();
    }

    /// Sleeps up to `ms` milliseconds, returning immediately once the token
    /// is set. An early wake is normal operation, not an error.
    pub fn sleep_ms(&self, ms: i64) {
        if ms <= 0 || self.is_set() {
            return;
        }
        let guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let _ = self
            .inner
            .wake
            .wait_timeout_while(guard, Duration::from_millis(ms as u64), |_| !self.is_set())
            .unwrap_or_else(|e| e.into_inner());
    }

    /// A clock whose sleeps wake as soon as this token is set, so paced loops
    /// never sit out a full iteration budget during shutdown.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(TokenClock {
            token: self.clone(),
        })
    }
}

impl Default for QuitToken {
    fn default() -> Self {
        Self::new()
    }
}

struct TokenClock {
    token: QuitToken,
}

impl Clock for TokenClock {
    fn elapsed_ms(&self) -> i64 {
        self.token.inner.origin.elapsed().as_millis() as i64
    }

    fn sleep_ms(&self, ms: i64) {
        self.token.sleep_ms(ms);
    }
}

/// One loop body. `run_iteration` is invoked repeatedly until the quit token
/// is set; an `Err` from it is logged and the loop keeps going, so transient
/// failures (a dropped camera link, a failed decode) never kill the thread.
pub trait LoopTask: Send {
    /// Called once on the worker thread before the first iteration.
    fn on_start(&mut self, _quit: &QuitToken) -> Result<()> {
        Ok(())
    }

    /// Called in a loop as long as the quit token is not set.
    fn run_iteration(&mut self, quit: &QuitToken) -> Result<()>;

    /// Called once after the last iteration, including after an `on_start`
    /// failure.
    fn on_stop(&mut self) {}
}

/// Owns one worker thread running a `LoopTask`.
pub struct LoopRunner {
    name: String,
    quit: QuitToken,
    join: Option<JoinHandle<()>>,
}

impl LoopRunner {
    /// Spawns the named worker thread and starts iterating the task.
    pub fn spawn<T: LoopTask + 'static>(name: &str, mut task: T) -> Result<Self> {
        let quit = QuitToken::new();
        let thread_quit = quit.clone();
        let thread_name = name.to_string();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                match task.on_start(&thread_quit) {
                    Ok(()) => {
                        while !thread_quit.is_set() {
                            if let Err(e) = task.run_iteration(&thread_quit) {
                                log::warn!("{}: iteration failed: {:#}", thread_name, e);
                            }
                        }
                    }
                    Err(e) => log::error!("{}: startup failed: {:#}", thread_name, e),
                }
                task.on_stop();
            })
            .map_err(|e| anyhow!("failed to spawn thread '{}': {}", name, e))?;
        Ok(Self {
            name: name.to_string(),
            quit,
            join: Some(join),
        })
    }

    pub fn quit_token(&self) -> QuitToken {
        self.quit.clone()
    }

    /// Signals the quit token and joins the worker. Idempotent; a second call
    /// is a no-op. Returns an error if the worker panicked.
    pub fn stop(&mut self) -> Result<()> {
        self.quit.set();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("worker thread '{}' panicked", self.name))?;
        }
        Ok(())
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("dropping runner: {:#}", e);
        }
    }
}
