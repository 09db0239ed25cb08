//! Monotonic-enough wall clock abstraction.
//!
//! The scheduler's behavior is entirely driven by `DateTime<Utc>` comparisons
//! (`scheduled_for`, `heartbeat_at`, backoff schedules). Routing all of it
//! through a [`Clock`] trait instead of calling `Utc::now()` directly lets
//! tests exercise backoff and staleness scenarios without real sleeps.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Anything that can report the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock, backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests to assert on
/// backoff schedules and staleness thresholds deterministically.
#[derive(Debug, Clone)]
pub struct FixedClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.inner.lock().expect("clock mutex poisoned");
        *guard += delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.inner.lock().expect("clock mutex poisoned");
        *guard = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().expect("clock mutex poisoned")
    }
}

pub type SharedClock = Arc<dyn Clock>;
