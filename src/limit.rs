//! Rate limiting: the shared capability contract, the in-memory engines,
//! and the HTTP middleware that enforces a per-client budget.
//!
//! The pieces are deliberately decoupled:
//! - **Contract**: [`Limiter`] — `take` / `state` / `reset`. Everything a
//!   policy layer needs, nothing more, so the token-bucket and
//!   sliding-window engines interchange behind the same middleware.
//! - **Engines**: [`bucket::MemoryTokenBucket`] and
//!   [`window::MemorySlidingWindow`] here; Redis-backed twins live in the
//!   `sluice-redis` crate and run the identical state transition as one
//!   atomic server-side script.
//! - **Middleware**: [`RateLimitLayer`] wraps a tower service and spends
//!   one permit per request.
//!
//! Choosing an engine: the bucket allows short bursts up to capacity and
//! smooths over long horizons; the window enforces a hard count per rolling
//! interval with no burst allowance and one stored entry per in-window
//! request.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LimitError;

pub mod bucket;
pub mod key;
pub mod middleware;
pub mod window;

pub use bucket::{BucketConfig, BucketState, MemoryTokenBucket};
pub use key::{client_key, PeerAddr};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use window::{MemorySlidingWindow, WindowConfig, WindowDecision};

/// Outcome of a [`Limiter::take`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Take {
    /// Whether the permits were granted.
    pub allowed: bool,
    /// Budget left after this call (tokens, or free window slots).
    pub remaining: f64,
    /// How long to wait before the request could succeed. Zero when
    /// allowed.
    pub retry_after: Duration,
}

/// Engine-agnostic snapshot returned by [`Limiter::state`].
///
/// Engines expose richer inherent state types ([`BucketState`],
/// [`WindowDecision`]); this is the least common denominator the policy
/// layer can use for informational headers.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitState {
    /// Budget currently available.
    pub remaining: f64,
    /// Configured ceiling (bucket capacity, or max requests per window).
    pub limit: f64,
    /// Remaining lifetime of the key's record, if the engine tracks one.
    pub ttl: Option<Duration>,
}

/// The limiter capability contract.
///
/// Implementations must make each operation atomic per key: two concurrent
/// `take` calls for the same key observe each other's writes, never a torn
/// intermediate. The in-memory engines get this from a mutex; the Redis
/// engines from single-script execution on the server.
///
/// Any bucket that is missing or expired is implicitly born at full
/// capacity; there is no separate initializer.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Attempt to spend `permits` from the budget for `key`.
    ///
    /// `permits` must be positive and `key` non-empty, else
    /// [`LimitError::InvalidArgument`]. A request for more than the
    /// configured ceiling is denied, never an error: the returned
    /// `retry_after` reflects the full ask even though it can never be
    /// satisfied, and callers are expected to reject such asks upstream.
    async fn take(&self, key: &str, permits: f64) -> Result<Take, LimitError>;

    /// Observe the budget without spending. Lazy refill still applies, so
    /// the returned value is what the next `take` would see, and the
    /// record's TTL is re-armed.
    async fn state(&self, key: &str) -> Result<LimitState, LimitError>;

    /// Restore `key` to a full budget. Idempotent.
    async fn reset(&self, key: &str) -> Result<(), LimitError>;
}
