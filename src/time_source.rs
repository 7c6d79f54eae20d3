//! Wall-clock abstraction.
//!
//! SLA deadlines, COI activity windows and override expiry are all evaluated
//! against a `TimeSource` so background sweeps and tests can share one notion
//! of "now".

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced time, shared between clones.
#[derive(Debug, Clone)]
pub struct ManualTimeSource {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualTimeSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source_is_shared_between_clones() {
        let start = Utc::now();
        let time = ManualTimeSource::new(start);
        let other = time.clone();

        time.advance(Duration::days(2));

        assert_eq!(other.now(), start + Duration::days(2));
    }
}
