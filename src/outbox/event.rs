//! The staged event row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry budget stamped onto new events unless overridden.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Where an event sits in its lifecycle.
///
/// Transitions form a strict graph: `New → Processing → {Sent, Failed}`.
/// Recovery may flip a long-stale `Processing` back to `New`; an operator
/// reset may do the same for `Failed`. `Sent` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    New,
    Processing,
    Sent,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "NEW",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Sent => "SENT",
            EventStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a status column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(pub String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown outbox event status: {}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for EventStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(EventStatus::New),
            "PROCESSING" => Ok(EventStatus::Processing),
            "SENT" => Ok(EventStatus::Sent),
            "FAILED" => Ok(EventStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// One staged event. Written in the domain transaction, drained by the
/// relay, never deleted by either (retention is an operational concern).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    /// Kind of domain entity this event describes, e.g. `user`.
    pub aggregate_type: String,
    /// Identity of that entity, e.g. the user id.
    pub aggregate_id: String,
    /// Event kind, e.g. `user.created`.
    pub event_type: String,
    /// Opaque serialized payload; the relay never inspects it.
    pub payload: Vec<u8>,
    pub status: EventStatus,
    /// Target stream in the downstream log.
    pub topic: String,
    /// Explicit partition routing key; falls back to `aggregate_id`.
    pub partition_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last status transition time; `None` until first claimed.
    pub processed_at: Option<DateTime<Utc>>,
    /// Publish failures so far. Incremented only when a claimed publish
    /// fails.
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// A fresh `NEW` event with a v4 id, stamped now, carrying the default
    /// retry budget.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            status: EventStatus::New,
            topic: topic.into(),
            partition_key: None,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The key messages are routed by: the explicit partition key when
    /// present, otherwise the aggregate id (keeping per-aggregate order).
    pub fn partitioning_key(&self) -> &str {
        match self.partition_key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => &self.aggregate_id,
        }
    }

    /// Whether the retry budget is spent. Such events are parked in
    /// `FAILED` and never attempted again without operator intervention.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_events_start_clean() {
        let event = OutboxEvent::new("user", "u-1", "user.created", b"{}".to_vec(), "users");
        assert_eq!(event.status, EventStatus::New);
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.max_retries, DEFAULT_MAX_RETRIES);
        assert!(event.processed_at.is_none());
        assert!(event.last_error.is_none());
        assert!(!event.retries_exhausted());
    }

    #[test]
    fn partitioning_key_prefers_the_explicit_key() {
        let event = OutboxEvent::new("user", "u-1", "user.created", vec![], "users");
        assert_eq!(event.partitioning_key(), "u-1");

        let event = event.with_partition_key("tenant-7");
        assert_eq!(event.partitioning_key(), "tenant-7");
    }

    #[test]
    fn empty_partition_key_falls_back_to_aggregate_id() {
        let event =
            OutboxEvent::new("user", "u-1", "user.created", vec![], "users").with_partition_key("");
        assert_eq!(event.partitioning_key(), "u-1");
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in
            [EventStatus::New, EventStatus::Processing, EventStatus::Sent, EventStatus::Failed]
        {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("PENDING".parse::<EventStatus>().is_err());
    }

    #[test]
    fn retry_budget_is_exhaustible() {
        let mut event =
            OutboxEvent::new("user", "u-1", "user.created", vec![], "users").with_max_retries(2);
        event.retry_count = 1;
        assert!(!event.retries_exhausted());
        event.retry_count = 2;
        assert!(event.retries_exhausted());
    }
}
