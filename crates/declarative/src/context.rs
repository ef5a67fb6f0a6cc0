//! Run context: cancellation, time and progress reporting
//!
//! These traits allow the engine to be driven without depending on a real
//! clock or a particular UI, so tests can step time by hand.

use crate::types::Report;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Longest single sleep between cancellation checks
const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Cooperative cancellation signal shared between runs
///
/// Cloning yields a handle on the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation
    ///
    /// Returns `false` if the token was cancelled before the full duration
    /// elapsed.
    pub fn sleep(&self, clock: &dyn Clock, duration: Duration) -> bool {
        let deadline = clock.now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = clock.now();
            if now >= deadline {
                return true;
            }
            clock.sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Source of time for polling loops
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock whose sleeps advance time instantly
///
/// Useful for testing polling loops without waiting.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += duration;
    }

    /// Total time slept so far
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Progress callback for multi-task runs
///
/// Implement this trait to receive progress updates during execution.
pub trait ProgressCallback: Send + Sync {
    /// Called before a task starts
    fn on_task_start(&self, index: usize, description: &str);

    /// Called when a task finishes; `outcome` is the report or the error text
    fn on_task_complete(&self, index: usize, description: &str, outcome: Result<&Report, &str>);
}

/// Progress callback that does nothing
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_task_start(&self, _index: usize, _description: &str) {}
    fn on_task_complete(&self, _index: usize, _description: &str, _outcome: Result<&Report, &str>) {}
}
