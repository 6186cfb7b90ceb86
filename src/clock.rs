//! Settlement Clock
//!
//! Market timing rules (betting cutoff, earliest resolution) are evaluated
//! against a `Clock`, never against ambient system time, so simulations and
//! tests can drive time explicitly.

use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Seconds since Unix epoch.
pub type UnixSecs = i64;

pub const SECS_PER_MINUTE: UnixSecs = 60;
pub const SECS_PER_HOUR: UnixSecs = 3_600;

/// Source of the current time for settlement decisions.
pub trait Clock: Send + Sync {
    /// Current time in Unix seconds.
    fn now(&self) -> UnixSecs;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> UnixSecs {
        Utc::now().timestamp()
    }
}

/// Monotonic, manually advanced clock.
///
/// # Determinism Contract
/// - `now()` only changes through `advance_to` / `advance_by`
/// - time never moves backward; attempts to do so are ignored and logged
#[derive(Debug)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    #[inline]
    pub fn new(start: UnixSecs) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    /// Advance to an absolute time. Earlier times are ignored.
    pub fn advance_to(&self, new_time: UnixSecs) {
        let prev = self.current.fetch_max(new_time, Ordering::SeqCst);
        if new_time < prev {
            tracing::warn!(
                current = prev,
                requested = new_time,
                "ManualClock: refusing to go backward"
            );
        }
    }

    /// Advance by a non-negative delta.
    pub fn advance_by(&self, delta: UnixSecs) {
        if delta < 0 {
            tracing::warn!(delta, "ManualClock: negative delta ignored");
            return;
        }
        self.current.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> UnixSecs {
        self.current.load(Ordering::SeqCst)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_monotonic() {
        let clock = ManualClock::new(100);
        clock.advance_by(SECS_PER_MINUTE);
        assert_eq!(clock.now(), 160);

        clock.advance_to(50);
        assert_eq!(clock.now(), 160, "clock must not move backward");

        clock.advance_by(-10);
        assert_eq!(clock.now(), 160);

        clock.advance_to(160 + SECS_PER_HOUR);
        assert_eq!(clock.now(), 3_760);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2023-11-14, well before any plausible test run
        assert!(SystemClock.now() > 1_700_000_000);
    }
}
