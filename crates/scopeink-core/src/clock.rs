//! Time sources.
//!
//! All engine timestamps are milliseconds since the Unix epoch. The clock is
//! injected so TTLs, heartbeats, backoff and debouncing can be driven by tests.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// A source of the current time.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.set(now);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.get()
    }
}

/// Issues strictly increasing `clientUpdatedAt` stamps.
///
/// Two mutations within the same millisecond still get distinct, ordered
/// stamps, and a stamp never goes backwards if the wall clock does.
#[derive(Debug, Default)]
pub struct MonotonicStamp {
    last: Timestamp,
}

impl MonotonicStamp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stamp at or after `now`.
    pub fn next(&mut self, now: Timestamp) -> Timestamp {
        self.last = now.max(self.last.saturating_add(1));
        self.last
    }

    /// Next stamp that is also strictly after `floor`.
    pub fn next_after(&mut self, now: Timestamp, floor: Timestamp) -> Timestamp {
        self.last = self.last.max(floor);
        self.next(now)
    }

    /// Keep later stamps above one seen elsewhere.
    pub fn observe(&mut self, stamp: Timestamp) {
        self.last = self.last.max(stamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        other.advance(500);
        assert_eq!(clock.now(), 1_500);
    }

    #[test]
    fn test_monotonic_stamp_never_repeats() {
        let mut stamp = MonotonicStamp::new();
        assert_eq!(stamp.next(100), 100);
        assert_eq!(stamp.next(100), 101);
        // Wall clock went backwards.
        assert_eq!(stamp.next(50), 102);
        assert_eq!(stamp.next(200), 200);
    }

    #[test]
    fn test_monotonic_stamp_after_floor() {
        let mut stamp = MonotonicStamp::new();
        assert_eq!(stamp.next_after(100, 500), 501);
        assert_eq!(stamp.next(100), 502);
    }

    #[test]
    fn test_monotonic_stamp_saturates() {
        let mut stamp = MonotonicStamp::new();
        stamp.observe(Timestamp::MAX);
        assert_eq!(stamp.next(100), Timestamp::MAX);
        assert_eq!(stamp.next_after(100, Timestamp::MAX), Timestamp::MAX);
    }
}
