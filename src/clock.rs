//! Injectable wall-clock time.
//!
//! All time reads in the engine go through a [`Clock`] so tests can advance
//! time deterministically. No action consults the system clock directly.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Convert an instant into an epoch value in the unit a plan's timestamp
/// column uses: seconds, or milliseconds when `in_millis` is set.
pub fn epoch_in(instant: DateTime<Utc>, in_millis: bool) -> i64 {
    if in_millis {
        instant.timestamp_millis()
    } else {
        instant.timestamp()
    }
}

/// Production clock reading the system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock frozen at a configured instant until advanced.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
