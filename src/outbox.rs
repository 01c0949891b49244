//! Transactional outbox: stage events in the same relational transaction
//! that mutates domain state, then relay them to a partitioned log.
//!
//! The pieces, leaves first:
//! - [`event`]: the staged event row and its status graph
//!   (`NEW → PROCESSING → {SENT, FAILED}`, recovery flips stale
//!   `PROCESSING` back to `NEW`).
//! - [`store`]: the [`OutboxStore`] contract the relay drives — batch
//!   select, conditional claim, terminal marks, stale release — plus an
//!   in-memory implementation. The Postgres implementation (and the
//!   transactional writer) live in `sluice-postgres`.
//! - [`publisher`]: the [`Publisher`] contract toward the log; one
//!   successful return means one durably committed message. The Kafka
//!   implementation lives in `sluice-kafka`.
//! - [`partition`]: pluggable partition selection for logs that expose it.
//! - [`relay`]: the polling loop tying the above together, with retry
//!   bookkeeping and crash recovery.

pub mod event;
pub mod partition;
pub mod publisher;
pub mod relay;
pub mod store;

pub use event::{EventStatus, OutboxEvent, DEFAULT_MAX_RETRIES};
pub use partition::{
    AggregateHashPartitioner, EventTypePartitioner, KeyHashPartitioner, Partitioner,
    RoundRobinPartitioner,
};
pub use publisher::{MemoryPublisher, Publisher};
pub use relay::{Relay, RelayConfig};
pub use store::{MemoryOutbox, OutboxStore, RETRIES_EXHAUSTED_ERROR};
