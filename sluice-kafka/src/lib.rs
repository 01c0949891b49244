#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! Kafka publisher for the `sluice` outbox relay.
//!
//! Configured for the strongest delivery the broker offers: acks from all
//! in-sync replicas, the idempotent producer, and bounded in-flight
//! requests so retries cannot reorder a partition. One successful
//! [`Publisher::publish`] return means the cluster has accepted and
//! replicated exactly one message for the event.
//!
//! Message shape: the value is the event's opaque payload; the key is its
//! partitioning key (explicit partition key, else aggregate id), which
//! preserves per-aggregate ordering through the log's per-partition
//! guarantee; headers carry the event metadata so consumers can
//! deduplicate on the event id if they need stricter semantics.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;

use sluice::error::PublishError;
use sluice::outbox::{OutboxEvent, Publisher};

/// Producer parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    /// Comma-separated broker list.
    pub brokers: String,
    pub client_id: String,
    /// Stream written to by writers that do not pick one per event.
    pub default_topic: String,
    /// Upper bound on one delivery, local queueing and retries included.
    /// The relay's processing timeout must exceed this.
    pub message_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "outbox-relay".to_string(),
            default_topic: "user-events".to_string(),
            message_timeout: Duration::from_secs(30),
        }
    }
}

impl KafkaConfig {
    /// Read `KAFKA_BROKERS`, `KAFKA_CLIENT_ID`, and `KAFKA_TOPIC` from the
    /// environment, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            brokers: std::env::var("KAFKA_BROKERS").unwrap_or(defaults.brokers),
            client_id: std::env::var("KAFKA_CLIENT_ID").unwrap_or(defaults.client_id),
            default_topic: std::env::var("KAFKA_TOPIC").unwrap_or(defaults.default_topic),
            message_timeout: defaults.message_timeout,
        }
    }
}

/// Publisher backed by an rdkafka [`FutureProducer`].
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl std::fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPublisher")
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            .set("message.send.max.retries", "5")
            .set("retry.backoff.ms", "100")
            .set("compression.type", "snappy")
            .set("message.timeout.ms", &config.message_timeout.as_millis().to_string())
            .set("socket.timeout.ms", "30000")
            .create()?;
        Ok(Self { producer, send_timeout: config.message_timeout })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        let event_id = event.id.to_string();
        let created_at = event.created_at.to_rfc3339();
        let headers = OwnedHeaders::new()
            .insert(Header { key: "event_id", value: Some(&event_id) })
            .insert(Header { key: "event_type", value: Some(&event.event_type) })
            .insert(Header { key: "aggregate_type", value: Some(&event.aggregate_type) })
            .insert(Header { key: "aggregate_id", value: Some(&event.aggregate_id) })
            .insert(Header { key: "created_at", value: Some(&created_at) });

        let record = FutureRecord::to(&event.topic)
            .payload(&event.payload)
            .key(event.partitioning_key())
            .headers(headers)
            .timestamp(event.created_at.timestamp_millis());

        match self.producer.send(record, Timeout::After(self.send_timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    event_id = %event.id,
                    topic = %event.topic,
                    partition,
                    offset,
                    "event published"
                );
                Ok(())
            }
            Err((error, _message)) => Err(PublishError::new(format!(
                "kafka send to topic {} failed",
                event.topic
            ))
            .with_source(error)),
        }
    }
}
