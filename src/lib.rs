#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Sluice
//!
//! Serving infrastructure that sits in front of and alongside a domain
//! service: a **distributed rate limiter** and a **transactional outbox
//! relay**.
//!
//! ## Rate limiting
//!
//! Per-key budgets enforced through the [`limit::Limiter`] contract —
//! `take` / `state` / `reset` — by two engines: a token bucket (bursts up
//! to capacity, lazy time-based refill) and a sliding window (hard count
//! per rolling interval). The in-memory engines live here; the
//! `sluice-redis` crate runs the identical state transitions as atomic
//! server-side scripts so many stateless front-ends share one enforcement
//! surface. [`limit::RateLimitLayer`] puts either engine in front of a
//! tower service.
//!
//! ## Outbox relay
//!
//! Events staged in the same relational transaction as the domain change
//! ([`outbox::OutboxEvent`]), drained by a polling [`outbox::Relay`]:
//! claim (`NEW → PROCESSING`), publish, mark (`SENT`/`FAILED`), with
//! retry bookkeeping and crash recovery. The store and publisher are
//! contracts ([`outbox::OutboxStore`], [`outbox::Publisher`]); Postgres
//! and Kafka bindings live in `sluice-postgres` and `sluice-kafka`.
//!
//! ## Quick start
//!
//! ```rust
//! use sluice::limit::{BucketConfig, Limiter, MemoryTokenBucket};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sluice::LimitError> {
//!     let bucket = MemoryTokenBucket::new(BucketConfig {
//!         capacity: 10.0,
//!         refill_rate: 1.0,
//!         ttl: Duration::from_secs(300),
//!     })?;
//!
//!     let take = bucket.take("client-42", 3.0).await?;
//!     assert!(take.allowed);
//!     assert_eq!(take.remaining, 7.0);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod clock;
pub mod error;
pub mod limit;
pub mod outbox;
pub mod prelude;
pub mod sleeper;

pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LimitError, PublishError, StoreError};
pub use limit::{LimitState, Limiter, Take};
pub use outbox::{EventStatus, OutboxEvent, OutboxStore, Publisher, Relay, RelayConfig};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
