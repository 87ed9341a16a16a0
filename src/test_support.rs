//! Deterministic test doubles shared by this crate's own test suites.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::clock::MonotonicClock;

/// A [`MonotonicClock`] a test can wind forward or pin, to control exactly
/// what an event's stamped timestamp and a lifetime's start time are.
pub struct FakeClock {
    start_time_ms: i64,
    now_ms: AtomicI64,
}

impl FakeClock {
    /// `start_time_ms` plays the role of wall-clock process start time;
    /// `now_ms()` starts at 0 and only advances when [`FakeClock::advance`]
    /// is called.
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            start_time_ms,
            now_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl MonotonicClock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn advance_moves_now_ms_forward_without_touching_start_time() {
        let clock = FakeClock::new(1_000);
        assert_eq!(clock.now_ms(), 0);
        assert_eq!(clock.start_time_ms(), 1_000);

        clock.advance(50);
        assert_eq!(clock.now_ms(), 50);
        assert_eq!(clock.start_time_ms(), 1_000);
    }
}
