use std::sync::Mutex;

use agent_runs_domain::{now_utc, DateTimeUtc};

/// Source of "now" for every time-dependent decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTimeUtc;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTimeUtc {
        now_utc()
    }
}

/// Settable clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTimeUtc>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTimeUtc) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, value: DateTimeUtc) {
        match self.now.lock() {
            Ok(mut now) => *now = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    pub fn advance(&self, by: time::Duration) {
        let next = self.now() + by;
        self.set(next);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTimeUtc {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
