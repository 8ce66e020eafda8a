//! Rate-limited reporting of non-fatal failures.
//!
//! Sink and exporter failures must never fail a request, but they should
//! not vanish either. The first failure is logged immediately; later ones
//! are folded into a suppressed count until the interval has passed.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct FailureReporter {
    what: &'static str,
    interval: Duration,
    last_logged: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
    total: AtomicU64,
}

impl FailureReporter {
    pub fn new(what: &'static str) -> Self {
        Self::with_interval(what, DEFAULT_INTERVAL)
    }

    pub fn with_interval(what: &'static str, interval: Duration) -> Self {
        Self {
            what,
            interval,
            last_logged: Mutex::new(None),
            suppressed: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Record a failure. Returns `true` if it was logged.
    pub fn report(&self, error: &dyn Display) -> bool {
        self.total.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        {
            let mut last = self.last_logged.lock().unwrap_or_else(PoisonError::into_inner);
            match *last {
                Some(at) if now.duration_since(at) < self.interval => {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                _ => *last = Some(now),
            }
        }
        let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
        tracing::warn!(
            failure = self.what,
            error = %error,
            suppressed,
            "{} failed",
            self.what
        );
        true
    }

    /// Failures seen since creation, logged or not.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
