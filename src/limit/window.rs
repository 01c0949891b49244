//! In-memory sliding window engine.
//!
//! Counts requests per rolling interval at millisecond resolution: drop
//! members older than `now - window`, admit if the survivors number fewer
//! than the maximum, and record the admission. No burst allowance, long
//! memory (every in-window request is one stored entry) — the counterpart
//! to the token bucket's smoothing. The Redis twin in `sluice-redis` keeps
//! the members in a sorted set and runs the same transition as one script.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::error::LimitError;
use crate::limit::{LimitState, Limiter, Take};

/// Window parameters, applied on every access.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    /// Length of the rolling interval.
    pub window: Duration,
    /// Maximum admissions inside any interval. Must be positive.
    pub max_requests: u64,
    /// Idle lifetime of a key's member set; re-armed on every access.
    pub ttl: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
            ttl: Duration::from_secs(300),
        }
    }
}

impl WindowConfig {
    /// Read `WINDOW_SECONDS`, `WINDOW_MAX_REQUESTS`, and
    /// `WINDOW_TTL_SECONDS` from the environment, falling back to the
    /// defaults for anything missing or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window: env_u64("WINDOW_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            max_requests: env_u64("WINDOW_MAX_REQUESTS").unwrap_or(defaults.max_requests),
            ttl: env_u64("WINDOW_TTL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
        }
    }

    fn validate(&self) -> Result<(), LimitError> {
        if self.window.is_zero() {
            return Err(LimitError::invalid_argument("window must be positive"));
        }
        if self.max_requests == 0 {
            return Err(LimitError::invalid_argument("max requests must be positive"));
        }
        if self.ttl.is_zero() {
            return Err(LimitError::invalid_argument("ttl must be positive"));
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Outcome of a window check.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Admissions currently inside the window (including this one, when
    /// allowed).
    pub current_count: u64,
    /// Window bounds in milliseconds since the epoch.
    pub window_start: u64,
    pub window_end: u64,
    /// Time until the oldest admission rolls out, clamped to
    /// `[0, window]`. Zero when allowed.
    pub retry_after: Duration,
}

#[derive(Debug, Default)]
struct Members {
    hits: VecDeque<u64>,
    expires_at: u64,
}

/// Sliding window engine holding its state in process memory.
#[derive(Debug)]
pub struct MemorySlidingWindow<C: Clock = SystemClock> {
    config: WindowConfig,
    clock: C,
    slots: Mutex<HashMap<String, Members>>,
}

impl MemorySlidingWindow<SystemClock> {
    pub fn new(config: WindowConfig) -> Result<Self, LimitError> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> MemorySlidingWindow<C> {
    pub fn with_clock(config: WindowConfig, clock: C) -> Result<Self, LimitError> {
        config.validate()?;
        Ok(Self { config, clock, slots: Mutex::new(HashMap::new()) })
    }

    /// Admit one request if the rolling count permits, recording it.
    pub async fn allow(&self, key: &str) -> Result<WindowDecision, LimitError> {
        check_key(key)?;
        let now = self.clock.now_millis();
        let window_ms = self.config.window.as_millis() as u64;
        let start = now.saturating_sub(window_ms);

        let mut slots = self.slots.lock().unwrap();
        let members = self.surviving(&mut slots, key, now, start);

        let count = members.hits.len() as u64;
        let decision = if count < self.config.max_requests {
            members.hits.push_back(now);
            WindowDecision {
                allowed: true,
                current_count: count + 1,
                window_start: start,
                window_end: now,
                retry_after: Duration::ZERO,
            }
        } else {
            let retry_ms = members
                .hits
                .front()
                .map(|&oldest| (oldest + window_ms).saturating_sub(now).min(window_ms))
                .unwrap_or(0);
            WindowDecision {
                allowed: false,
                current_count: count,
                window_start: start,
                window_end: now,
                retry_after: Duration::from_millis(retry_ms),
            }
        };
        Ok(decision)
    }

    /// Current count without recording an admission.
    pub async fn window_state(&self, key: &str) -> Result<WindowDecision, LimitError> {
        check_key(key)?;
        let now = self.clock.now_millis();
        let window_ms = self.config.window.as_millis() as u64;
        let start = now.saturating_sub(window_ms);

        let mut slots = self.slots.lock().unwrap();
        let members = self.surviving(&mut slots, key, now, start);
        let count = members.hits.len() as u64;
        Ok(WindowDecision {
            allowed: count < self.config.max_requests,
            current_count: count,
            window_start: start,
            window_end: now,
            retry_after: Duration::ZERO,
        })
    }

    /// Forget every admission for `key`.
    pub async fn clear(&self, key: &str) -> Result<(), LimitError> {
        check_key(key)?;
        self.slots.lock().unwrap().remove(key);
        Ok(())
    }

    /// Evict expired records and out-of-window members, re-arm the TTL,
    /// and hand back the key's member set.
    fn surviving<'a>(
        &self,
        slots: &'a mut HashMap<String, Members>,
        key: &str,
        now: u64,
        start: u64,
    ) -> &'a mut Members {
        let members = slots.entry(key.to_string()).or_default();
        if members.expires_at <= now && !members.hits.is_empty() {
            members.hits.clear();
        }
        while members.hits.front().is_some_and(|&hit| hit <= start) {
            members.hits.pop_front();
        }
        members.expires_at = now + self.config.ttl.as_millis() as u64;
        members
    }
}

fn check_key(key: &str) -> Result<(), LimitError> {
    if key.is_empty() {
        return Err(LimitError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

#[async_trait]
impl<C: Clock> Limiter for MemorySlidingWindow<C> {
    /// The window admits requests one at a time; `permits` other than one
    /// has no meaning for a counted interval.
    async fn take(&self, key: &str, permits: f64) -> Result<Take, LimitError> {
        if permits != 1.0 {
            return Err(LimitError::invalid_argument(
                "sliding window admits exactly one permit per take",
            ));
        }
        let decision = self.allow(key).await?;
        Ok(Take {
            allowed: decision.allowed,
            remaining: self.config.max_requests.saturating_sub(decision.current_count) as f64,
            retry_after: decision.retry_after,
        })
    }

    async fn state(&self, key: &str) -> Result<LimitState, LimitError> {
        let decision = self.window_state(key).await?;
        Ok(LimitState {
            remaining: self.config.max_requests.saturating_sub(decision.current_count) as f64,
            limit: self.config.max_requests as f64,
            ttl: Some(self.config.ttl),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), LimitError> {
        self.clear(key).await
    }
}
