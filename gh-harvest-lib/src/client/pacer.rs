//! Traffic pacing and temporary pausing for one API family.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Spaces requests at a steady rate and supports temporary pausing.
///
/// Wrap in an `Arc` via [`Pacer::new`], then call [`Pacer::acquire`]
/// before each request. Callers are spaced so the steady-state rate never
/// exceeds the configured requests-per-second. Any task can call
/// [`Pacer::pause_for`] to halt dispatch (e.g. after a rate-limit
/// response); when multiple pauses overlap, the longest wins.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_dispatch: tokio::sync::Mutex<Option<Instant>>,
    paused: AtomicBool,
    resume: Notify,
    /// When the current pause should expire. Ensures the longest pause
    /// wins when `pause_for` calls overlap.
    resume_at: std::sync::Mutex<Option<Instant>>,
}

impl Pacer {
    /// Create a pacer that dispatches at most `requests_per_second`.
    pub fn new(requests_per_second: f64) -> Arc<Self> {
        Arc::new(Self {
            min_interval: Duration::from_secs_f64(1.0 / requests_per_second),
            last_dispatch: tokio::sync::Mutex::new(None),
            paused: AtomicBool::new(false),
            resume: Notify::new(),
            resume_at: std::sync::Mutex::new(None),
        })
    }

    /// Wait until unpaused and the minimum inter-request interval has
    /// elapsed, then claim the next dispatch slot.
    ///
    /// The interval lock is held across the wait so concurrent callers
    /// serialize; each slot is at least `min_interval` after the last.
    pub async fn acquire(&self) {
        loop {
            if self.paused.load(Ordering::Acquire) {
                self.resume.notified().await;
                continue;
            }

            let mut last = self.last_dispatch.lock().await;
            let now = Instant::now();
            if let Some(prev) = *last {
                let elapsed = now.duration_since(prev);
                if elapsed < self.min_interval {
                    tokio::time::sleep(self.min_interval - elapsed).await;
                }
            }
            *last = Some(Instant::now());
            return;
        }
    }

    /// Returns whether dispatch is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Minimum extension required for a new pause to override an active
    /// one. Prevents near-simultaneous callers that discovered the same
    /// rate-limit reset time from each "winning" the pause.
    const MIN_PAUSE_EXTENSION: Duration = Duration::from_secs(1);

    /// Pause dispatching for `duration`, then automatically resume.
    ///
    /// Tasks waiting in [`acquire`](Self::acquire) remain parked until
    /// the duration elapses. If an equivalent or longer pause is already
    /// active this call is a no-op and returns `false`.
    pub fn pause_for(self: &Arc<Self>, duration: Duration) -> bool {
        let new_resume_at = Instant::now() + duration;

        {
            let mut guard = self.resume_at.lock().expect("lock not poisoned");
            if guard.is_some_and(|existing| existing + Self::MIN_PAUSE_EXTENSION >= new_resume_at) {
                return false;
            }
            *guard = Some(new_resume_at);
        }

        self.paused.store(true, Ordering::Release);
        let this = Arc::clone(self);
        drop(tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            let should_resume = {
                let mut guard = this.resume_at.lock().expect("lock not poisoned");
                if guard.is_some_and(|t| Instant::now() >= t) {
                    *guard = None;
                    true
                } else {
                    false // a longer pause was scheduled after us
                }
            };

            if should_resume {
                this.paused.store(false, Ordering::Release);
                this.resume.notify_waiters();
            }
        }));

        true
    }
}
