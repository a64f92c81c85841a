//! Time source for epoch and deadline decisions.

#[cfg(any(test, feature = "test-utils"))]
use std::sync::{Arc, Mutex};

#[cfg(any(test, feature = "test-utils"))]
use chrono::Duration;
use chrono::{DateTime, Utc};

/// Source of "now" for every ledger decision.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock shared between a test and the ledger under test.
///
/// Clones observe the same instant, so advancing one advances all.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().expect("manual clock lock poisoned") = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().expect("manual clock lock poisoned");
        *guard += by;
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock lock poisoned")
    }
}
