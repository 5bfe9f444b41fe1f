//! Clock abstraction for time-dependent checks.
//!
//! Temporal validation and record timestamps use injected clocks rather than
//! direct `SystemTime` access, which keeps expiry logic deterministic in
//! tests and makes recovery decisions reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Trait for clock implementations.
pub trait Clock: Send + Sync {
    /// Returns the current Unix timestamp in seconds.
    fn now_secs(&self) -> u64;

    /// Returns the current Unix timestamp in nanoseconds.
    fn now_ns(&self) -> u64;
}

/// System clock backed by real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
    }

    fn now_ns(&self) -> u64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    /// The fixed timestamp in seconds.
    pub secs: u64,
}

impl FixedClock {
    /// Creates a fixed clock at the given Unix timestamp in seconds.
    #[must_use]
    pub const fn new(secs: u64) -> Self {
        Self { secs }
    }
}

impl Clock for FixedClock {
    fn now_secs(&self) -> u64 {
        self.secs
    }

    fn now_ns(&self) -> u64 {
        self.secs * 1_000_000_000
    }
}

/// Wrapper that makes `now_ns` strictly monotonic.
///
/// Record timestamps must be strictly increasing within one process even if
/// the wall clock steps backwards; the wrapper remembers the last value it
/// returned and never repeats or regresses.
pub struct MonotonicClock {
    inner: Arc<dyn Clock>,
    last_ns: AtomicU64,
}

impl MonotonicClock {
    /// Wraps a clock with a strictly monotonic nanosecond view.
    #[must_use]
    pub fn new(inner: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            last_ns: AtomicU64::new(0),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_secs(&self) -> u64 {
        self.inner.now_secs()
    }

    fn now_ns(&self) -> u64 {
        let now = self.inner.now_ns();
        let mut last = self.last_ns.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_ns.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::new(1_700_000_000);
        assert_eq!(clock.now_secs(), 1_700_000_000);
        assert_eq!(clock.now_ns(), 1_700_000_000 * 1_000_000_000);
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        assert!(clock.now_secs() > 1_600_000_000);
    }

    #[test]
    fn test_monotonic_never_repeats() {
        let clock = MonotonicClock::new(Arc::new(FixedClock::new(100)));
        let a = clock.now_ns();
        let b = clock.now_ns();
        let c = clock.now_ns();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_monotonic_tracks_real_time() {
        let clock = MonotonicClock::new(Arc::new(SystemClock));
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b > a);
        // Stays close to the wall clock rather than drifting by whole steps
        assert!(b - a < 1_000_000_000);
    }
}
