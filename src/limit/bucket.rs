//! In-memory token bucket engine.
//!
//! Runs the same state transition as the Redis scripts in `sluice-redis`,
//! with a mutex standing in for server-side atomicity: read the record
//! (defaulting to a full bucket), add `elapsed * refill_rate` clamped to
//! capacity, spend if the pool covers the ask, and always write back with
//! `last_refill = now` and a re-armed TTL. Suitable for single-process
//! deployments and for driving the policy layer in tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::LimitError;
use crate::limit::{LimitState, Limiter, Take};

/// Bucket parameters. Applied on every access, so a reconfigured engine
/// redefines live buckets without any migration.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    /// Maximum tokens a bucket can hold. Must be positive.
    pub capacity: f64,
    /// Tokens added per second. Must be positive.
    pub refill_rate: f64,
    /// Idle lifetime of a bucket record; re-armed on every access. An
    /// expired bucket is reborn at full capacity.
    pub ttl: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { capacity: 100.0, refill_rate: 10.0, ttl: Duration::from_secs(300) }
    }
}

impl BucketConfig {
    /// Read `BUCKET_CAPACITY`, `BUCKET_REFILL_RATE`, and
    /// `BUCKET_TTL_SECONDS` from the environment, falling back to the
    /// defaults for anything missing or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            capacity: env_f64("BUCKET_CAPACITY").unwrap_or(defaults.capacity),
            refill_rate: env_f64("BUCKET_REFILL_RATE").unwrap_or(defaults.refill_rate),
            ttl: env_f64("BUCKET_TTL_SECONDS")
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.ttl),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), LimitError> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(LimitError::invalid_argument("capacity must be positive"));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(LimitError::invalid_argument("refill rate must be positive"));
        }
        if self.ttl.is_zero() {
            return Err(LimitError::invalid_argument("ttl must be positive"));
        }
        Ok(())
    }
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).filter(|v: &f64| v.is_finite())
}

/// Full bucket state as seen by [`MemoryTokenBucket::bucket_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct BucketState {
    /// Tokens available right now, after lazy refill.
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    /// Seconds-since-epoch of the last refill (fractional).
    pub last_refill: f64,
    /// Record lifetime as re-armed by this read.
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    tokens: f64,
    last_refill: f64,
    expires_at: f64,
}

/// Token bucket engine holding its state in process memory.
#[derive(Debug)]
pub struct MemoryTokenBucket<C: Clock = SystemClock> {
    config: BucketConfig,
    clock: C,
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryTokenBucket<SystemClock> {
    pub fn new(config: BucketConfig) -> Result<Self, LimitError> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> MemoryTokenBucket<C> {
    pub fn with_clock(config: BucketConfig, clock: C) -> Result<Self, LimitError> {
        config.validate()?;
        Ok(Self { config, clock, slots: Mutex::new(HashMap::new()) })
    }

    /// Read the full bucket state. Performs lazy refill and re-arms the
    /// TTL, so the returned `tokens` is exactly what the next `take` sees.
    pub async fn bucket_state(&self, key: &str) -> Result<BucketState, LimitError> {
        check_key(key)?;
        let now = self.clock.now_secs();
        let mut slots = self.slots.lock().unwrap();
        let tokens = self.refreshed(slots.get(key), now);
        slots.insert(key.to_string(), self.slot(tokens, now));
        Ok(BucketState {
            tokens,
            capacity: self.config.capacity,
            refill_rate: self.config.refill_rate,
            last_refill: now,
            ttl: self.config.ttl,
        })
    }

    /// Current pool for a slot, defaulting absent or expired records to a
    /// full bucket born now.
    fn refreshed(&self, slot: Option<&Slot>, now: f64) -> f64 {
        match slot {
            Some(slot) if slot.expires_at > now => {
                let elapsed = (now - slot.last_refill).max(0.0);
                (slot.tokens + elapsed * self.config.refill_rate).min(self.config.capacity)
            }
            _ => self.config.capacity,
        }
    }

    fn slot(&self, tokens: f64, now: f64) -> Slot {
        Slot { tokens, last_refill: now, expires_at: now + self.config.ttl.as_secs_f64() }
    }
}

fn check_key(key: &str) -> Result<(), LimitError> {
    if key.is_empty() {
        return Err(LimitError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

#[async_trait]
impl<C: Clock> Limiter for MemoryTokenBucket<C> {
    async fn take(&self, key: &str, permits: f64) -> Result<Take, LimitError> {
        check_key(key)?;
        if !(permits.is_finite() && permits > 0.0) {
            return Err(LimitError::invalid_argument("tokens must be positive"));
        }

        let now = self.clock.now_secs();
        let mut slots = self.slots.lock().unwrap();
        let pool = self.refreshed(slots.get(key), now);

        let take = if pool >= permits {
            Take { allowed: true, remaining: pool - permits, retry_after: Duration::ZERO }
        } else {
            let deficit = permits - pool;
            Take {
                allowed: false,
                remaining: pool,
                retry_after: Duration::try_from_secs_f64(deficit / self.config.refill_rate)
                    .unwrap_or(Duration::MAX),
            }
        };

        let tokens = if take.allowed { take.remaining } else { pool };
        slots.insert(key.to_string(), self.slot(tokens, now));
        Ok(take)
    }

    async fn state(&self, key: &str) -> Result<LimitState, LimitError> {
        let state = self.bucket_state(key).await?;
        Ok(LimitState {
            remaining: state.tokens,
            limit: state.capacity,
            ttl: Some(state.ttl),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), LimitError> {
        check_key(key)?;
        let now = self.clock.now_secs();
        let mut slots = self.slots.lock().unwrap();
        slots.insert(key.to_string(), self.slot(self.config.capacity, now));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bucket(capacity: f64, refill_rate: f64) -> (MemoryTokenBucket<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        clock.set(1_000_000_000); // non-zero origin
        let engine = MemoryTokenBucket::with_clock(
            BucketConfig { capacity, refill_rate, ttl: Duration::from_secs(60) },
            clock.clone(),
        )
        .expect("valid config");
        (engine, clock)
    }

    #[tokio::test]
    async fn fresh_key_is_born_full() {
        let (engine, _) = bucket(10.0, 1.0);
        let take = engine.take("u", 10.0).await.unwrap();
        assert!(take.allowed);
        assert_eq!(take.remaining, 0.0);
    }

    #[tokio::test]
    async fn denial_reports_remaining_and_retry_after() {
        let (engine, _) = bucket(10.0, 1.0);
        engine.take("u", 10.0).await.unwrap();

        let take = engine.take("u", 1.0).await.unwrap();
        assert!(!take.allowed);
        assert_eq!(take.remaining, 0.0);
        // one token at one token per second
        assert!((take.retry_after.as_secs_f64() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn refill_is_lazy_and_clamped_to_capacity() {
        let (engine, clock) = bucket(10.0, 2.0);
        engine.take("u", 10.0).await.unwrap();

        clock.advance(Duration::from_secs(3));
        let state = engine.bucket_state("u").await.unwrap();
        assert!((state.tokens - 6.0).abs() < 1e-9);

        clock.advance(Duration::from_secs(3600));
        let state = engine.bucket_state("u").await.unwrap();
        assert_eq!(state.tokens, 10.0);
    }

    #[tokio::test]
    async fn asking_for_more_than_capacity_denies_honestly() {
        let (engine, _) = bucket(10.0, 2.0);
        let take = engine.take("u", 15.0).await.unwrap();
        assert!(!take.allowed);
        assert_eq!(take.remaining, 10.0);
        // (15 - 10) / 2 = 2.5 seconds, even though the ask can never succeed
        assert!((take.retry_after.as_secs_f64() - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_positive_permits_are_rejected() {
        let (engine, _) = bucket(10.0, 1.0);
        assert!(engine.take("u", 0.0).await.unwrap_err().is_invalid_argument());
        assert!(engine.take("u", -1.0).await.unwrap_err().is_invalid_argument());
        assert!(engine.take("u", f64::NAN).await.unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let (engine, _) = bucket(10.0, 1.0);
        assert!(engine.take("", 1.0).await.unwrap_err().is_invalid_argument());
        assert!(engine.state("").await.unwrap_err().is_invalid_argument());
        assert!(engine.reset("").await.unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn expired_bucket_is_reborn_full() {
        let (engine, clock) = bucket(5.0, 0.001);
        engine.take("u", 5.0).await.unwrap();

        // Past the 60s TTL: the drained record is gone, the key is fresh.
        clock.advance(Duration::from_secs(61));
        let take = engine.take("u", 5.0).await.unwrap();
        assert!(take.allowed);
    }

    #[tokio::test]
    async fn access_rearms_ttl() {
        let (engine, clock) = bucket(5.0, 0.001);
        engine.take("u", 5.0).await.unwrap();

        // Touch the bucket every 40s; it must never expire.
        for _ in 0..3 {
            clock.advance(Duration::from_secs(40));
            engine.bucket_state("u").await.unwrap();
        }
        let take = engine.take("u", 5.0).await.unwrap();
        assert!(!take.allowed, "bucket kept alive by accesses must still be drained");
    }

    #[tokio::test]
    async fn reset_restores_full_capacity() {
        let (engine, _) = bucket(10.0, 1.0);
        engine.take("u", 10.0).await.unwrap();
        engine.reset("u").await.unwrap();
        let state = engine.bucket_state("u").await.unwrap();
        assert_eq!(state.tokens, 10.0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (engine, _) = bucket(5.0, 1.0);
        engine.take("a", 5.0).await.unwrap();
        let take = engine.take("b", 5.0).await.unwrap();
        assert!(take.allowed);
    }

    #[test]
    fn config_validation_rejects_nonsense() {
        assert!(MemoryTokenBucket::new(BucketConfig {
            capacity: 0.0,
            ..BucketConfig::default()
        })
        .is_err());
        assert!(MemoryTokenBucket::new(BucketConfig {
            refill_rate: -1.0,
            ..BucketConfig::default()
        })
        .is_err());
        assert!(MemoryTokenBucket::new(BucketConfig {
            ttl: Duration::ZERO,
            ..BucketConfig::default()
        })
        .is_err());
    }
}
