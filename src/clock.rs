//! Time source abstraction
//!
//! Freshness decisions (TTL expiry, hot-run guards, market-hours checks) all
//! flow through a `Clock` so isolated instances can be driven through
//! deterministic schedules in tests.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Source of "now" for every freshness decision in the cache.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 10, 2, 15, 0).unwrap());
        let t0 = clock.now_utc();
        clock.advance(chrono::Duration::seconds(70));
        assert_eq!(clock.now_utc() - t0, chrono::Duration::seconds(70));
    }
}
