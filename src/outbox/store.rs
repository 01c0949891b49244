//! The store contract the relay drives, and an in-memory implementation.
//!
//! Writers insert rows inside their own domain transaction (see the
//! `sluice-postgres` crate for the transactional `enqueue`); the relay
//! owns every update after commit. The claim is the linchpin: a
//! conditional `NEW → PROCESSING` transition that either succeeds exactly
//! once across all relay instances or reports the race, which is the sole
//! mechanism preventing double publish.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::outbox::event::{EventStatus, OutboxEvent};

/// Error recorded on rows parked after their retry budget is spent. Rows
/// carrying this message are terminal: the recovery pass never revives
/// them.
pub const RETRIES_EXHAUSTED_ERROR: &str = "exceeded maximum retry attempts";

/// Relay-side view of the outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` rows in `NEW`, oldest first. A read-committed
    /// snapshot is enough; [`claim`](OutboxStore::claim) re-validates per
    /// row.
    async fn fetch_new(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Conditionally transition `id` from `NEW` to `PROCESSING`, stamping
    /// the transition time. `Ok(false)` means another worker holds the row
    /// (or it is gone) — a race, not an error.
    async fn claim(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Transition a claimed row to `SENT`. Terminal.
    async fn mark_sent(&self, id: Uuid) -> Result<(), StoreError>;

    /// Transition a claimed row to `FAILED`, recording the publish error
    /// and spending one retry. This is the only operation that increments
    /// the retry count.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Park a row in `FAILED`, recording `error`, without spending a
    /// retry — for rows whose budget is already exhausted. Parking with
    /// [`RETRIES_EXHAUSTED_ERROR`] makes the row terminal.
    async fn park(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Revive rows abandoned longer than `older_than` ago: `PROCESSING`
    /// rows (orphaned by a crashed claimant) and `FAILED` rows awaiting a
    /// retry go back to `NEW` with the transition stamp cleared. Rows
    /// parked with [`RETRIES_EXHAUSTED_ERROR`] stay put. Returns how many
    /// rows were revived.
    async fn release_stale(&self, older_than: Duration) -> Result<u64, StoreError>;
}

fn is_parked(event: &OutboxEvent) -> bool {
    event.retries_exhausted()
        && event.last_error.as_deref() == Some(RETRIES_EXHAUSTED_ERROR)
}

/// Outbox held in process memory. Single-process development and tests;
/// the same transition rules as the Postgres implementation, serialized by
/// a mutex instead of row locks.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    events: Mutex<Vec<OutboxEvent>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an event. The in-memory stand-in for the transactional
    /// writer.
    pub fn insert(&self, event: OutboxEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxEvent> {
        self.events.lock().unwrap().iter().find(|e| e.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<OutboxEvent> {
        self.events.lock().unwrap().clone()
    }

    fn update<F>(&self, id: Uuid, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut OutboxEvent),
    {
        let mut events = self.events.lock().unwrap();
        match events.iter_mut().find(|e| e.id == id) {
            Some(event) => {
                apply(event);
                Ok(())
            }
            None => Err(StoreError::message(format!("no outbox event with id {}", id))),
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn fetch_new(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let events = self.events.lock().unwrap();
        let mut batch: Vec<OutboxEvent> =
            events.iter().filter(|e| e.status == EventStatus::New).cloned().collect();
        batch.sort_by_key(|e| e.created_at);
        batch.truncate(limit);
        Ok(batch)
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut events = self.events.lock().unwrap();
        match events.iter_mut().find(|e| e.id == id) {
            Some(event) if event.status == EventStatus::New => {
                event.status = EventStatus::Processing;
                event.processed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sent(&self, id: Uuid) -> Result<(), StoreError> {
        self.update(id, |event| {
            event.status = EventStatus::Sent;
            event.processed_at = Some(Utc::now());
        })
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.update(id, |event| {
            event.status = EventStatus::Failed;
            event.retry_count += 1;
            event.last_error = Some(error.to_string());
            event.processed_at = Some(Utc::now());
        })
    }

    async fn park(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.update(id, |event| {
            event.status = EventStatus::Failed;
            event.last_error = Some(error.to_string());
            event.processed_at = Some(Utc::now());
        })
    }

    async fn release_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| StoreError::message(format!("invalid staleness cutoff: {}", e)))?;
        let cutoff = Utc::now() - older_than;

        let mut events = self.events.lock().unwrap();
        let mut released = 0;
        for event in events.iter_mut() {
            let stale = event.processed_at.is_some_and(|at| at < cutoff);
            let revivable = match event.status {
                EventStatus::Processing => stale,
                EventStatus::Failed => stale && !is_parked(event),
                EventStatus::New | EventStatus::Sent => false,
            };
            if revivable {
                event.status = EventStatus::New;
                event.processed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}
