//! Clock abstraction for reroute passes
//!
//! A reroute pass reads the clock exactly once at construction and every
//! decision in the pass (delay expiry, unassigned timestamps) uses that fixed
//! value. Injecting the clock keeps passes reproducible under test.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the per-pass timestamps
pub trait Clock: Send + Sync {
    /// Monotonic-enough nanoseconds used for delay arithmetic
    fn now_nanos(&self) -> i64;

    /// Wall-clock milliseconds recorded on unassigned shards for operators
    fn now_millis(&self) -> i64;
}

/// Wall-clock implementation used in production
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }

    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start_nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(start_nanos),
        }
    }

    /// Advance the clock by the given number of nanoseconds
    pub fn advance_nanos(&self, delta: i64) {
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }

    /// Advance the clock by the given number of milliseconds
    pub fn advance_millis(&self, delta: i64) {
        self.advance_nanos(delta * 1_000_000);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn now_millis(&self) -> i64 {
        self.now_nanos() / 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000_000);
        assert_eq!(clock.now_nanos(), 1_000_000);
        assert_eq!(clock.now_millis(), 1);

        clock.advance_millis(60_000);
        assert_eq!(clock.now_millis(), 60_001);
    }

    #[test]
    fn test_system_clock_is_nonzero() {
        let clock = SystemClock;
        assert!(clock.now_nanos() > 0);
        assert!(clock.now_millis() > 0);
    }
}
