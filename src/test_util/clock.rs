//! A clock that only moves when told to.

use crate::util::clock::Clock;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone)]
pub struct ControlledClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ControlledClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Moves this clock and all its clones forward.
    pub fn advance_by(&self, duration: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += duration;
    }
}

impl Clock for ControlledClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
