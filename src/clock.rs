//! Time sources for the in-process limiter engines.
//!
//! The distributed engines never consult these: their clock is the store's
//! own (the Redis `TIME` command), so that many front-ends sharing one
//! bucket agree on elapsed time. The in-memory engines take a [`Clock`] so
//! refill math can be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Thread-safe time source with microsecond resolution.
///
/// Readings are microseconds since the UNIX epoch (or a test-controlled
/// origin) and must be non-decreasing per instance.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in microseconds since the implementer's origin.
    fn now_micros(&self) -> u64;

    /// Current time as fractional seconds.
    fn now_secs(&self) -> f64 {
        self.now_micros() as f64 / 1_000_000.0
    }

    /// Current time in whole milliseconds.
    fn now_millis(&self) -> u64 {
        self.now_micros() / 1_000
    }
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        let since_epoch =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        u64::try_from(since_epoch.as_micros()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock for tests. Starts at zero; only moves when told to.
///
/// Clones share the same underlying reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let micros = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute reading.
    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_non_decreasing() {
        let clock = SystemClock;
        let first = clock.now_micros();
        let second = clock.now_micros();
        assert!(second >= first);
    }

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_micros(), 0);
        assert_eq!(clock.now_micros(), 0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_micros(), 1_500_000);
        assert_eq!(clock.now_millis(), 1_500);
        assert!((clock.now_secs() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn manual_clock_clones_share_readings() {
        let clock = ManualClock::new();
        let clone = clock.clone();
        clock.advance(Duration::from_secs(2));
        assert_eq!(clone.now_micros(), 2_000_000);

        clone.set(10_000_000);
        assert_eq!(clock.now_secs(), 10.0);
    }

    #[test]
    fn trait_object_usage() {
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let _ = clock.now_secs();
    }
}
