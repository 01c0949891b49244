//! Delay schedules for the relay's failure path.
//!
//! The relay polls at a fixed interval while healthy; when consecutive
//! ticks fail (store outage, usually) it stretches the wait so a dead
//! database is not hammered. `failures = 0` means healthy and yields no
//! extra delay.

use std::time::Duration;

/// Delay schedule keyed by the number of consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay no matter how long the outage lasts.
    Constant { delay: Duration },
    /// Doubling delay, capped. `base` is the delay after the first failure.
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Backoff::Exponential { base, cap }
    }

    /// Delay to wait after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, cap } => {
                let doublings = failures.saturating_sub(1).min(32);
                let nanos = base
                    .as_nanos()
                    .saturating_mul(1u128 << doublings)
                    .min(cap.as_nanos());
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_failures_means_no_delay() {
        let constant = Backoff::constant(Duration::from_secs(1));
        assert_eq!(constant.delay(0), Duration::ZERO);

        let exponential =
            Backoff::exponential(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(exponential.delay(0), Duration::ZERO);
    }

    #[test]
    fn constant_ignores_failure_count() {
        let backoff = Backoff::constant(Duration::from_secs(5));
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(100), Duration::from_secs(5));
    }

    #[test]
    fn exponential_doubles_until_cap() {
        let backoff = Backoff::exponential(Duration::from_secs(5), Duration::from_secs(40));
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(2), Duration::from_secs(10));
        assert_eq!(backoff.delay(3), Duration::from_secs(20));
        assert_eq!(backoff.delay(4), Duration::from_secs(40));
        assert_eq!(backoff.delay(5), Duration::from_secs(40));
        assert_eq!(backoff.delay(64), Duration::from_secs(40));
    }

    #[test]
    fn huge_failure_counts_saturate_at_cap() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }
}
