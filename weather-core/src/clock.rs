//! Wall-clock abstraction.
//!
//! Cache expiry and circuit-breaker recovery are decided against a [`Clock`]
//! instead of `Utc::now()` directly, so tests can drive time by hand.

use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Real time.
#[derive(Debug, Clone, Copy, Default)]
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
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.checked_add_signed(to_time_delta(by)).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Converts a std duration, saturating at the largest representable span.
pub(crate) fn to_time_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// `true` once at least `span` has passed between `since` and `now`.
pub(crate) fn has_elapsed(since: DateTime<Utc>, now: DateTime<Utc>, span: Duration) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed >= span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_when_asked() {
        let clock = ManualClock::default();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, TimeDelta::seconds(90));
    }

    #[test]
    fn has_elapsed_is_inclusive_and_rejects_negative_spans() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let t60 = t0 + TimeDelta::seconds(60);

        assert!(has_elapsed(t0, t60, Duration::from_secs(60)));
        assert!(!has_elapsed(t0, t60, Duration::from_secs(61)));
        assert!(!has_elapsed(t60, t0, Duration::from_secs(0)));
    }
}
