//! Single-slot frame handoff between a producer thread and its consumers.
//!
//! This is deliberately not a queue: the slot holds the most recently
//! published frame and nothing else. A consumer that wants a frame newer than
//! the slot contents posts a pending-request token and waits, bounded by its
//! own timeout; the producer publishes into the slot only when such a token
//! exists, clearing the token and waking every waiter registered before the
//! publish. A slow consumer therefore sees stale frames instead of creating
//! back-pressure, and a fast producer never blocks on its consumers.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::frame::VideoFrame;

/// Upper bound on how long a waiter sleeps between cancellation checks.
const WAKE_SLICE: Duration = Duration::from_millis(25);

#[derive(Default)]
struct Slot {
    frame: Option<VideoFrame>,
    pending: bool,
    // Bumped on every publish (and on release_waiters). Waiters block on a
    // generation change, not on the pending token: a new request posted right
    // after a publish must not put an already-satisfied waiter back to sleep.
    generation: u64,
}

/// Latest-wins frame slot with a pull-and-wait protocol.
pub struct FrameCache {
    slot: Mutex<Slot>,
    fresh: Condvar,
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            fresh: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A poisoned slot only means a producer died mid-publish of an
        // already-complete frame; the contents stay usable.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Posts the pending-request token. Idempotent: a second request arriving
    /// before the token is consumed joins the same wait.
    pub fn request_fresh(&self) {
        self.lock().pending = true;
    }

    /// True when a consumer is waiting for a fresh frame. Producers use this
    /// to skip publish work when nobody asked.
    pub fn has_pending_request(&self) -> bool {
        self.lock().pending
    }

    /// Producer side: if a request is pending, stores the frame, consumes the
    /// token and wakes all current waiters. Returns whether the frame was
    /// published.
    pub fn publish_if_requested(&self, frame: VideoFrame) -> bool {
        let mut slot = self.lock();
        if !slot.pending {
            return false;
        }
        slot.frame = Some(frame);
        slot.pending = false;
        slot.generation = slot.generation.wrapping_add(1);
        drop(slot);
        self.fresh.notify_all();
        true
    }

    /// The slot contents, possibly stale, without requesting a refresh.
    pub fn latest(&self) -> Option<VideoFrame> {
        self.lock().frame.clone()
    }

    /// Consumer side: request a fresh frame and wait up to `timeout` for the
    /// producer to supply one. On timeout, returns whatever the slot holds
    /// (the previous frame, or `None` if nothing was ever published). Never
    /// blocks past `timeout`.
    pub fn pull_latest(&self, timeout: Duration) -> Option<VideoFrame> {
        self.pull_latest_while(timeout, || true)
    }

    /// Like [`pull_latest`](Self::pull_latest), but also stops waiting once
    /// `keep_waiting` returns false, returning the slot contents as on a
    /// timeout. The predicate is polled between short sleeps, so cancellation
    /// latency is bounded by a fraction of the timeout.
    pub fn pull_latest_while(
        &self,
        timeout: Duration,
        keep_waiting: impl Fn() -> bool,
    ) -> Option<VideoFrame> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        let entered = slot.generation;
        slot.pending = true;
        while slot.generation == entered && keep_waiting() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = (deadline - now).min(WAKE_SLICE);
            let (guard, _timed_out) = self
                .fresh
                .wait_timeout(slot, slice)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
        slot.frame.clone()
    }

    /// Consumes any pending token and wakes all waiters with the current slot
    /// contents. Called by a stopping producer so no consumer waits out its
    /// full timeout against a dead thread.
    pub fn release_waiters(&self) {
        let mut slot = self.lock();
        slot.pending = false;
        slot.generation = slot.generation.wrapping_add(1);
        drop(slot);
        self.fresh.notify_all();
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::Arc;
    use std::time::Instant;

    fn frame(value: u8) -> VideoFrame {
        VideoFrame::new(2, 2, PixelFormat::Gray8, vec![value; 4]).unwrap()
    }

    #[test]
    fn pull_with_no_producer_returns_none_within_timeout() {
        let cache = FrameCache::new();
        let start = Instant::now();
        let got = cache.pull_latest(Duration::from_millis(50));
        assert!(got.is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "woke too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "blocked too long: {:?}", elapsed);
    }

    #[test]
    fn pull_timeout_returns_previous_frame() {
        let cache = FrameCache::new();
        cache.request_fresh();
        assert!(cache.publish_if_requested(frame(1)));

        // No new publish: the pull times out and falls back to the stale slot.
        let got = cache.pull_latest(Duration::from_millis(10)).unwrap();
        assert_eq!(got.data(), &[1, 1, 1, 1]);
    }

    #[test]
    fn publish_without_request_is_dropped() {
        let cache = FrameCache::new();
        assert!(!cache.publish_if_requested(frame(1)));
        assert!(cache.latest().is_none());
    }

    #[test]
    fn request_fresh_is_idempotent() {
        let cache = FrameCache::new();
        cache.request_fresh();
        cache.request_fresh();
        assert!(cache.has_pending_request());
        assert!(cache.publish_if_requested(frame(3)));
        // Token consumed by the single publish.
        assert!(!cache.has_pending_request());
        assert!(!cache.publish_if_requested(frame(4)));
    }

    #[test]
    fn publish_wakes_all_waiters_with_the_same_frame() {
        let cache = Arc::new(FrameCache::new());
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let cache = cache.clone();
            waiters.push(std::thread::spawn(move || {
                cache.pull_latest(Duration::from_secs(5))
            }));
        }

        // Give the waiters time to register before the publish.
        while !cache.has_pending_request() {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        let published = frame(9);
        assert!(cache.publish_if_requested(published.clone()));

        let start = Instant::now();
        for waiter in waiters {
            let got = waiter.join().unwrap().expect("waiter should get a frame");
            assert!(got.shares_pixels_with(&published));
        }
        assert!(start.elapsed() < Duration::from_secs(4), "waiters did not unblock early");
    }

    #[test]
    fn late_request_does_not_put_a_satisfied_waiter_back_to_sleep() {
        let cache = Arc::new(FrameCache::new());
        let puller = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.pull_latest(Duration::from_secs(5)))
        };
        while !cache.has_pending_request() {
            std::thread::sleep(Duration::from_millis(1));
        }

        // Publish, then immediately post a new request before the waiter has
        // had a chance to reacquire the lock. The waiter belongs to the
        // earlier generation and must still unblock with the published frame.
        let start = Instant::now();
        let published = frame(7);
        assert!(cache.publish_if_requested(published.clone()));
        cache.request_fresh();

        let got = puller.join().unwrap().expect("waiter should get a frame");
        assert!(got.shares_pixels_with(&published));
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "waiter was re-trapped by the follow-up request: {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn pull_stops_waiting_when_told_to() {
        let cache = Arc::new(FrameCache::new());
        let abort = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let puller = {
            let cache = cache.clone();
            let abort = abort.clone();
            std::thread::spawn(move || {
                cache.pull_latest_while(Duration::from_secs(10), || {
                    !abort.load(std::sync::atomic::Ordering::Acquire)
                })
            })
        };
        while !cache.has_pending_request() {
            std::thread::sleep(Duration::from_millis(1));
        }
        let start = Instant::now();
        abort.store(true, std::sync::atomic::Ordering::Release);
        let got = puller.join().unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn release_waiters_unblocks_a_pull_early() {
        let cache = Arc::new(FrameCache::new());
        let puller = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.pull_latest(Duration::from_secs(10)))
        };
        while !cache.has_pending_request() {
            std::thread::sleep(Duration::from_millis(1));
        }
        let start = Instant::now();
        cache.release_waiters();
        let got = puller.join().unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
