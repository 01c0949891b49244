#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! Redis-backed engines for the `sluice` rate limiter.
//!
//! Each operation is one Lua script executed atomically on the server, so
//! any number of stateless front-ends share a single enforcement surface
//! with strict per-key serialization and no read-modify-write races. Time
//! comes from the Redis `TIME` command, never from callers: many callers
//! share one bucket, and only the store's clock is common to all of them.
//!
//! Records are hashes (`token_bucket:<key>`) or sorted sets
//! (`sliding_window:<key>`) with a TTL re-armed on every access; an
//! expired or never-seen key is implicitly a full budget. Capacity and
//! refill parameters ride along on every call, so reconfigured engines
//! redefine live keys without any migration.
//!
//! Fractional values cross the Lua boundary as strings: Redis truncates
//! Lua numbers to integers in replies, which would round a sub-second
//! `retry_after` down to zero.

mod scripts;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::time::timeout;

use sluice::error::LimitError;
use sluice::limit::{BucketState, LimitState, Limiter, Take, WindowDecision};

/// Ceiling on any single store operation, connection setup included.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection and bucket parameters for [`RedisTokenBucket`].
#[derive(Debug, Clone, PartialEq)]
pub struct RedisBucketConfig {
    /// `host:port` of the Redis server.
    pub addr: String,
    pub password: String,
    pub db: i64,
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Idle lifetime of a bucket key; re-armed on every access.
    pub ttl: Duration,
}

impl Default for RedisBucketConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: String::new(),
            db: 0,
            capacity: 100.0,
            refill_rate: 10.0,
            ttl: Duration::from_secs(300),
        }
    }
}

impl RedisBucketConfig {
    /// Read `REDIS_ADDR`, `REDIS_PASSWORD`, `REDIS_DB`, `BUCKET_CAPACITY`,
    /// `BUCKET_REFILL_RATE`, and `BUCKET_TTL_SECONDS` from the
    /// environment, falling back to the defaults for anything missing or
    /// unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: std::env::var("REDIS_ADDR").unwrap_or(defaults.addr),
            password: std::env::var("REDIS_PASSWORD").unwrap_or(defaults.password),
            db: env_parse("REDIS_DB").unwrap_or(defaults.db),
            capacity: env_parse("BUCKET_CAPACITY").unwrap_or(defaults.capacity),
            refill_rate: env_parse("BUCKET_REFILL_RATE").unwrap_or(defaults.refill_rate),
            ttl: env_parse("BUCKET_TTL_SECONDS")
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.ttl),
        }
    }

    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }

    fn validate(&self) -> Result<(), LimitError> {
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

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Token bucket whose state lives in Redis.
#[derive(Clone)]
pub struct RedisTokenBucket {
    conn: ConnectionManager,
    capacity: f64,
    refill_rate: f64,
    ttl_secs: f64,
    take_script: Script,
    state_script: Script,
    reset_script: Script,
}

impl std::fmt::Debug for RedisTokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl RedisTokenBucket {
    /// Connect and verify the server answers within the operation
    /// timeout.
    pub async fn connect(config: RedisBucketConfig) -> Result<Self, LimitError> {
        config.validate()?;
        let conn = connect(&config.url()).await?;
        Ok(Self {
            conn,
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            ttl_secs: config.ttl.as_secs_f64(),
            take_script: Script::new(scripts::TAKE_TOKENS),
            state_script: Script::new(scripts::BUCKET_STATE),
            reset_script: Script::new(scripts::RESET_BUCKET),
        })
    }

    fn key_name(&self, key: &str) -> String {
        format!("token_bucket:{}", key)
    }

    /// Full bucket state. Performs lazy refill on the server and re-arms
    /// the TTL, so the returned `tokens` is what the next take sees.
    pub async fn bucket_state(&self, key: &str) -> Result<BucketState, LimitError> {
        check_key(key)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.state_script.prepare_invoke();
        invocation
            .key(self.key_name(key))
            .arg(self.capacity)
            .arg(self.refill_rate)
            .arg(self.ttl_secs);
        let (tokens, last_refill, ttl_secs): (String, String, i64) =
            bounded(invocation.invoke_async(&mut conn)).await?;
        Ok(BucketState {
            tokens: parse_float(&tokens)?,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            last_refill: parse_float(&last_refill)?,
            ttl: Duration::from_secs(u64::try_from(ttl_secs).unwrap_or(0)),
        })
    }
}

#[async_trait]
impl Limiter for RedisTokenBucket {
    async fn take(&self, key: &str, permits: f64) -> Result<Take, LimitError> {
        check_key(key)?;
        if !(permits.is_finite() && permits > 0.0) {
            return Err(LimitError::invalid_argument("tokens must be positive"));
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.take_script.prepare_invoke();
        invocation
            .key(self.key_name(key))
            .arg(permits)
            .arg(self.capacity)
            .arg(self.refill_rate)
            .arg(self.ttl_secs);
        let (allowed, remaining, retry_after): (i64, String, String) =
            bounded(invocation.invoke_async(&mut conn)).await?;

        Ok(Take {
            allowed: allowed == 1,
            remaining: parse_float(&remaining)?,
            retry_after: Duration::try_from_secs_f64(parse_float(&retry_after)?.max(0.0))
                .unwrap_or(Duration::MAX),
        })
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
        let mut conn = self.conn.clone();
        let mut invocation = self.reset_script.prepare_invoke();
        invocation
            .key(self.key_name(key))
            .arg(self.capacity)
            .arg(self.refill_rate)
            .arg(self.ttl_secs);
        bounded::<(), _>(invocation.invoke_async(&mut conn)).await
    }
}

/// Connection and window parameters for [`RedisSlidingWindow`].
#[derive(Debug, Clone, PartialEq)]
pub struct RedisWindowConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
    /// Length of the rolling interval.
    pub window: Duration,
    /// Maximum admissions inside any interval.
    pub max_requests: i64,
    pub ttl: Duration,
}

impl Default for RedisWindowConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: String::new(),
            db: 0,
            window: Duration::from_secs(60),
            max_requests: 100,
            ttl: Duration::from_secs(300),
        }
    }
}

impl RedisWindowConfig {
    /// Read `REDIS_ADDR`, `REDIS_PASSWORD`, `REDIS_DB`, `WINDOW_SECONDS`,
    /// `WINDOW_MAX_REQUESTS`, and `WINDOW_TTL_SECONDS` from the
    /// environment, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: std::env::var("REDIS_ADDR").unwrap_or(defaults.addr),
            password: std::env::var("REDIS_PASSWORD").unwrap_or(defaults.password),
            db: env_parse("REDIS_DB").unwrap_or(defaults.db),
            window: env_parse("WINDOW_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            max_requests: env_parse("WINDOW_MAX_REQUESTS").unwrap_or(defaults.max_requests),
            ttl: env_parse("WINDOW_TTL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
        }
    }

    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }

    fn validate(&self) -> Result<(), LimitError> {
        if self.window.is_zero() {
            return Err(LimitError::invalid_argument("window must be positive"));
        }
        if self.max_requests <= 0 {
            return Err(LimitError::invalid_argument("max requests must be positive"));
        }
        if self.ttl.is_zero() {
            return Err(LimitError::invalid_argument("ttl must be positive"));
        }
        Ok(())
    }
}

/// Sliding window whose member set lives in a Redis sorted set.
#[derive(Clone)]
pub struct RedisSlidingWindow {
    conn: ConnectionManager,
    window_ms: i64,
    max_requests: i64,
    ttl_secs: f64,
    allow_script: Script,
    state_script: Script,
}

impl std::fmt::Debug for RedisSlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSlidingWindow")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl RedisSlidingWindow {
    pub async fn connect(config: RedisWindowConfig) -> Result<Self, LimitError> {
        config.validate()?;
        let conn = connect(&config.url()).await?;
        Ok(Self {
            conn,
            window_ms: i64::try_from(config.window.as_millis()).unwrap_or(i64::MAX),
            max_requests: config.max_requests,
            ttl_secs: config.ttl.as_secs_f64(),
            allow_script: Script::new(scripts::WINDOW_ALLOW),
            state_script: Script::new(scripts::WINDOW_STATE),
        })
    }

    fn key_name(&self, key: &str) -> String {
        format!("sliding_window:{}", key)
    }

    /// Admit one request if the rolling count permits, recording it.
    pub async fn allow(&self, key: &str) -> Result<WindowDecision, LimitError> {
        check_key(key)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.allow_script.prepare_invoke();
        invocation
            .key(self.key_name(key))
            .arg(self.max_requests)
            .arg(self.window_ms)
            .arg(self.ttl_secs);
        let (allowed, count, retry_after_ms, now_ms): (i64, i64, String, i64) =
            bounded(invocation.invoke_async(&mut conn)).await?;

        let now_ms = u64::try_from(now_ms).unwrap_or(0);
        let window_ms = u64::try_from(self.window_ms).unwrap_or(0);
        Ok(WindowDecision {
            allowed: allowed == 1,
            current_count: u64::try_from(count).unwrap_or(0),
            window_start: now_ms.saturating_sub(window_ms),
            window_end: now_ms,
            retry_after: Duration::try_from_secs_f64(
                (parse_float(&retry_after_ms)? / 1_000.0).max(0.0),
            )
            .unwrap_or(Duration::MAX),
        })
    }

    /// Current count without recording an admission.
    pub async fn window_state(&self, key: &str) -> Result<WindowDecision, LimitError> {
        check_key(key)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.state_script.prepare_invoke();
        invocation.key(self.key_name(key)).arg(self.window_ms).arg(self.ttl_secs);
        let (count, now_ms): (i64, i64) =
            bounded(invocation.invoke_async(&mut conn)).await?;

        let now_ms = u64::try_from(now_ms).unwrap_or(0);
        let window_ms = u64::try_from(self.window_ms).unwrap_or(0);
        Ok(WindowDecision {
            allowed: count < self.max_requests,
            current_count: u64::try_from(count).unwrap_or(0),
            window_start: now_ms.saturating_sub(window_ms),
            window_end: now_ms,
            retry_after: Duration::ZERO,
        })
    }

    /// Forget every admission for `key`.
    pub async fn clear(&self, key: &str) -> Result<(), LimitError> {
        check_key(key)?;
        let mut conn = self.conn.clone();
        let mut del = redis::cmd("DEL");
        del.arg(self.key_name(key));
        bounded::<i64, _>(del.query_async(&mut conn)).await?;
        Ok(())
    }
}

#[async_trait]
impl Limiter for RedisSlidingWindow {
    /// The window admits requests one at a time; `permits` other than one
    /// has no meaning for a counted interval.
    async fn take(&self, key: &str, permits: f64) -> Result<Take, LimitError> {
        if permits != 1.0 {
            return Err(LimitError::invalid_argument(
                "sliding window admits exactly one permit per take",
            ));
        }
        let decision = self.allow(key).await?;
        let max = u64::try_from(self.max_requests).unwrap_or(0);
        Ok(Take {
            allowed: decision.allowed,
            remaining: max.saturating_sub(decision.current_count) as f64,
            retry_after: decision.retry_after,
        })
    }

    async fn state(&self, key: &str) -> Result<LimitState, LimitError> {
        let decision = self.window_state(key).await?;
        let max = u64::try_from(self.max_requests).unwrap_or(0);
        Ok(LimitState {
            remaining: max.saturating_sub(decision.current_count) as f64,
            limit: self.max_requests as f64,
            ttl: Some(Duration::from_secs_f64(self.ttl_secs)),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), LimitError> {
        self.clear(key).await
    }
}

async fn connect(url: &str) -> Result<ConnectionManager, LimitError> {
    let client = redis::Client::open(url)
        .map_err(|e| LimitError::invalid_argument(format!("bad redis address: {}", e)))?;
    let mut conn = timeout(OP_TIMEOUT, ConnectionManager::new(client))
        .await
        .map_err(LimitError::store_unavailable)?
        .map_err(LimitError::store_unavailable)?;

    let ping = redis::cmd("PING");
    let _pong: String = timeout(OP_TIMEOUT, ping.query_async(&mut conn))
        .await
        .map_err(LimitError::store_unavailable)?
        .map_err(LimitError::store_unavailable)?;
    Ok(conn)
}

/// Bound a store future by [`OP_TIMEOUT`], folding both the timeout and
/// the driver error into [`LimitError::StoreUnavailable`].
async fn bounded<T, F>(fut: F) -> Result<T, LimitError>
where
    F: Future<Output = Result<T, redis::RedisError>>,
{
    timeout(OP_TIMEOUT, fut)
        .await
        .map_err(LimitError::store_unavailable)?
        .map_err(LimitError::store_unavailable)
}

fn check_key(key: &str) -> Result<(), LimitError> {
    if key.is_empty() {
        return Err(LimitError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

fn parse_float(value: &str) -> Result<f64, LimitError> {
    value.parse().map_err(|_| {
        LimitError::store_unavailable(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected numeric reply from store: {:?}", value),
        ))
    })
}
