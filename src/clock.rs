//! Time sources for staleness decisions.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, MutexGuard};

/// Source of "now" for resource transitions and staleness checks.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Move the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    *self.lock() += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.lock() = to;
  }

  fn lock(&self) -> MutexGuard<'_, DateTime<Utc>> {
    match self.now.lock() {
      Ok(now) => now,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.lock()
  }
}
