//! The polling loop draining the outbox toward the log.
//!
//! Any number of relay instances may run against one outbox; the
//! conditional claim keeps them from publishing the same row twice. A tick
//! selects a batch of `NEW` rows oldest-first and walks them one at a
//! time: park if the retry budget is spent, claim, publish, mark. Rows
//! orphaned in `PROCESSING` by a crashed worker are revived by the
//! recovery pass, which runs at startup and periodically thereafter.
//!
//! Transient store errors never tear the loop down: they are logged, the
//! wait stretches exponentially while the errors persist, and the loop
//! only exits on the shutdown signal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::backoff::Backoff;
use crate::error::StoreError;
use crate::outbox::event::OutboxEvent;
use crate::outbox::publisher::Publisher;
use crate::outbox::store::{OutboxStore, RETRIES_EXHAUSTED_ERROR};
use crate::sleeper::{Sleeper, TokioSleeper};

/// Relay cadence and batch parameters.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Wait between healthy ticks.
    pub poll_interval: Duration,
    /// Maximum rows selected per tick.
    pub batch_size: usize,
    /// Age past which a `PROCESSING` row counts as orphaned. Must exceed
    /// the publisher's maximum send timeout plus a margin, or recovery
    /// races live workers for their rows (safe, but the rows get delayed).
    pub processing_timeout: Duration,
    /// Cadence of the periodic recovery pass. Defaults to the processing
    /// timeout: recovering more often than rows can go stale buys nothing.
    pub recovery_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            processing_timeout: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Read `RELAY_POLL_INTERVAL`, `RELAY_BATCH_SIZE`,
    /// `RELAY_PROCESSING_TIMEOUT`, and `RELAY_RECOVERY_INTERVAL` (all
    /// seconds except the batch size) from the environment, falling back
    /// to the defaults for anything missing or unparseable. The recovery
    /// interval follows the processing timeout unless set explicitly.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let processing_timeout = env_u64("RELAY_PROCESSING_TIMEOUT")
            .map(Duration::from_secs)
            .unwrap_or(defaults.processing_timeout);
        Self {
            poll_interval: env_u64("RELAY_POLL_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            batch_size: env_u64("RELAY_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(defaults.batch_size),
            processing_timeout,
            recovery_interval: env_u64("RELAY_RECOVERY_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(processing_timeout),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// The relay worker. Cheap to construct; run it with [`Relay::run`] or
/// drive individual ticks with [`Relay::tick`].
pub struct Relay<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: RelayConfig,
    sleeper: Arc<dyn Sleeper>,
    backoff: Backoff,
}

impl<S, P> Relay<S, P>
where
    S: OutboxStore,
    P: Publisher,
{
    pub fn new(store: S, publisher: P, config: RelayConfig) -> Self {
        let backoff = Backoff::exponential(
            config.poll_interval,
            config.poll_interval.saturating_mul(8),
        );
        Self {
            store: Arc::new(store),
            publisher: Arc::new(publisher),
            config,
            sleeper: Arc::new(TokioSleeper),
            backoff,
        }
    }

    /// Swap the waiting strategy; tests use
    /// [`InstantSleeper`](crate::sleeper::InstantSleeper) to run the loop
    /// without delays.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// The store this relay drives.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The publisher this relay emits through.
    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Poll until `shutdown` turns true (or its sender is dropped).
    ///
    /// Runs the recovery pass once at startup, then alternates waiting and
    /// ticking, with a periodic recovery pass on its own cadence.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            batch_size = self.config.batch_size,
            "outbox relay starting"
        );

        match self.recover().await {
            Ok(released) if released > 0 => {
                tracing::info!(released, "startup recovery revived orphaned events");
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "startup recovery failed"),
        }

        let mut last_recovery = Instant::now();
        let mut consecutive_failures: u32 = 0;

        loop {
            let wait = if consecutive_failures == 0 {
                self.config.poll_interval
            } else {
                self.backoff.delay(consecutive_failures)
            };

            tokio::select! {
                _ = self.sleeper.sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("outbox relay shutting down");
                        return;
                    }
                    continue;
                }
            }

            if last_recovery.elapsed() >= self.config.recovery_interval {
                match self.recover().await {
                    Ok(released) if released > 0 => {
                        tracing::info!(released, "recovery revived orphaned events");
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "recovery pass failed"),
                }
                last_recovery = Instant::now();
            }

            match self.tick().await {
                Ok(_) => consecutive_failures = 0,
                Err(error) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::error!(
                        %error,
                        consecutive_failures,
                        "relay tick failed"
                    );
                }
            }
        }
    }

    /// One poll cycle: select a batch of `NEW` rows and process each in
    /// order. Returns how many were published. Per-row failures are logged
    /// and skipped; only the batch select itself can fail the tick.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let batch = self.store.fetch_new(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        tracing::debug!(count = batch.len(), "processing outbox batch");

        let mut published = 0;
        for event in &batch {
            match self.process(event).await {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(event_id = %event.id, %error, "failed to process outbox event");
                }
            }
        }
        Ok(published)
    }

    /// Revive `PROCESSING` rows older than the processing timeout.
    pub async fn recover(&self) -> Result<u64, StoreError> {
        self.store.release_stale(self.config.processing_timeout).await
    }

    /// Returns `Ok(true)` when the event was published and marked sent.
    async fn process(&self, event: &OutboxEvent) -> Result<bool, StoreError> {
        if event.retries_exhausted() {
            tracing::warn!(
                event_id = %event.id,
                retry_count = event.retry_count,
                "retry budget exhausted, parking event"
            );
            self.store.park(event.id, RETRIES_EXHAUSTED_ERROR).await?;
            return Ok(false);
        }

        if !self.store.claim(event.id).await? {
            tracing::debug!(event_id = %event.id, "event already claimed elsewhere");
            return Ok(false);
        }

        match self.publisher.publish(event).await {
            Ok(()) => {
                self.store.mark_sent(event.id).await?;
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    topic = %event.topic,
                    "event published"
                );
                Ok(true)
            }
            Err(error) => {
                tracing::warn!(event_id = %event.id, %error, "publish failed");
                self.store.mark_failed(event.id, &error.to_string()).await?;
                Ok(false)
            }
        }
    }
}
