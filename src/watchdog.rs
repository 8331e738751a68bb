use crate::error::ReduceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared flag checked by long-running work at its call boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self, during: &str) -> Result<(), ReduceError> {
        if self.is_cancelled() {
            Err(ReduceError::Cancelled(format!("cancelled during {}", during)))
        } else {
            Ok(())
        }
    }
}

/// Per-iteration deadline for one worker loop.
///
/// The loop arms it at the top of every fetch; the supervisor calls `fire` on each
/// reconciliation pass and abandons the slot when it returns true.
#[derive(Debug)]
pub struct Watchdog {
    limit: Duration,
    deadline: Mutex<Option<Instant>>,
    token: CancelToken,
}

impl Watchdog {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            deadline: Mutex::new(None),
            token: CancelToken::new(),
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Restart the timer for a new iteration.
    pub fn arm(&self) -> CancelToken {
        *self.lock() = Some(Instant::now() + self.limit);
        self.token.clone()
    }

    pub fn disarm(&self) {
        *self.lock() = None;
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.lock().is_some_and(|deadline| now >= deadline)
    }

    /// Cancel the token if the deadline has passed. Returns true only on the call that fired.
    pub fn fire(&self, now: Instant) -> bool {
        if self.token.is_cancelled() || !self.expired(now) {
            return false;
        }
        self.token.cancel();
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.deadline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
