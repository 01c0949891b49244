#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! Postgres-backed outbox store for the `sluice` relay.
//!
//! Two surfaces:
//! - the **writer**: [`PgOutboxStore::enqueue`] inserts an event row into
//!   a transaction the caller already holds, so the event commits or rolls
//!   back together with the domain rows it describes. The writer never
//!   commits or rolls back on its own.
//! - the **relay side**: the [`OutboxStore`] contract, implemented with
//!   conditional single-statement updates. The claim
//!   (`UPDATE ... WHERE id = $1 AND status = 'NEW'`) relies on row locks
//!   under read committed: of any number of relay instances racing for a
//!   row, exactly one sees one row affected.
//!
//! Schema lives in `migrations/`; run it with [`PgOutboxStore::migrate`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use sluice::error::StoreError;
use sluice::outbox::{EventStatus, OutboxEvent, OutboxStore, RETRIES_EXHAUSTED_ERROR};

const COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, status, topic, \
                       partition_key, created_at, processed_at, retry_count, max_retries, \
                       last_error";

/// Outbox store backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with bounded pool acquisition, so a dead database turns
    /// into an error instead of a hang.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Connect using the `DATABASE_URL` environment variable.
    pub async fn connect_from_env() -> Result<Self, sqlx::Error> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
        Self::connect(&url).await
    }

    /// The underlying pool, for callers that open their own domain
    /// transactions around [`enqueue`](Self::enqueue).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the outbox schema migration.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Insert `event` into the caller's open transaction.
    ///
    /// Commit and rollback stay with the caller: the invariant that no
    /// event row survives a rolled-back domain change (and vice versa)
    /// is exactly single-transaction atomicity.
    pub async fn enqueue(
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO outbox_events (id, aggregate_type, aggregate_id, event_type, payload, \
             status, topic, partition_key, created_at, retry_count, max_retries) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(&event.topic)
        .bind(&event.partition_key)
        .bind(event.created_at)
        .bind(event.retry_count)
        .bind(event.max_retries)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Fetch one event by id, mostly for operators and tests.
    pub async fn fetch(&self, id: Uuid) -> Result<Option<OutboxEvent>, StoreError> {
        let query = format!("SELECT {} FROM outbox_events WHERE id = $1", COLUMNS);
        let row: Option<EventRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::new)?;
        row.map(OutboxEvent::try_from).transpose()
    }
}

/// Direct mapping of the `outbox_events` table.
#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    topic: String,
    partition_key: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    last_error: Option<String>,
}

impl TryFrom<EventRow> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let status: EventStatus = row
            .status
            .parse()
            .map_err(|e: sluice::outbox::event::ParseStatusError| StoreError::message(e.to_string()))?;
        Ok(OutboxEvent {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status,
            topic: row.topic,
            partition_key: row.partition_key,
            created_at: row.created_at,
            processed_at: row.processed_at,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            last_error: row.last_error,
        })
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_new(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let query = format!(
            "SELECT {} FROM outbox_events WHERE status = 'NEW' ORDER BY created_at ASC LIMIT $1",
            COLUMNS
        );
        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::new)?;
        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'PROCESSING', processed_at = $2 \
             WHERE id = $1 AND status = 'NEW'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_events SET status = 'SENT', processed_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_events SET status = 'FAILED', retry_count = retry_count + 1, \
             last_error = $2, processed_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn park(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_events SET status = 'FAILED', last_error = $2, processed_at = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn release_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| StoreError::message(format!("invalid staleness cutoff: {}", e)))?;
        let cutoff = Utc::now() - older_than;

        // Orphaned claims and failures awaiting retry go back to NEW;
        // rows parked after retry exhaustion are terminal.
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'NEW', processed_at = NULL \
             WHERE processed_at < $1 \
               AND (status = 'PROCESSING' \
                    OR (status = 'FAILED' \
                        AND NOT (retry_count >= max_retries AND last_error = $2)))",
        )
        .bind(cutoff)
        .bind(RETRIES_EXHAUSTED_ERROR)
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(result.rows_affected())
    }
}
