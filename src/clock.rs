//! Monotonic time source behind a trait so paced loops can be tested
//! against a deterministic clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic millisecond clock used by paced loops.
///
/// `sleep_ms` is best-effort: implementations may wake early (for example
/// when a shutdown is signalled) and callers must treat an early wake as
/// "continue now", not as an error.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed on this clock. Monotonic, origin unspecified.
    fn elapsed_ms(&self) -> i64;

    /// Sleep for the given number of milliseconds. Non-positive values return
    /// immediately.
    fn sleep_ms(&self, ms: i64);
}

/// Wall clock backed by `Instant` and `thread::sleep`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn sleep_ms(&self, ms: i64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
    }
}

/// Deterministic clock for tests. Time only moves via `advance` or `sleep_ms`.
pub struct FakeClock {
    now_ms: AtomicI64,
}

impl FakeClock {
    pub fn starting_at(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn elapsed_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: i64) {
        if ms > 0 {
            self.advance(ms);
        }
    }
}
