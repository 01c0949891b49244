//! Integration test against a real Kafka-compatible broker (Redpanda).
//!
//! Run with `cargo test -p sluice-kafka -- --ignored` (requires Docker).

use std::time::Duration;

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::ClientConfig;
use serde_json::json;
use sluice::outbox::{OutboxEvent, Publisher};
use sluice_kafka::{KafkaConfig, KafkaPublisher};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

fn start_redpanda(docker: &Cli) -> (Container<'_, GenericImage>, String) {
    let image = GenericImage::new("docker.redpanda.com/redpanda/redpanda", "v23.3.8")
        .with_wait_for(WaitFor::message_on_stdout("Started Kafka API"));
    let container = docker.run(image);
    let brokers = format!("127.0.0.1:{}", container.get_host_port_ipv4(9092));
    (container, brokers)
}

#[tokio::test]
#[ignore]
async fn published_message_carries_key_payload_and_headers() {
    let docker = Cli::default();
    let (_node, brokers) = start_redpanda(&docker);

    let publisher = KafkaPublisher::new(&KafkaConfig {
        brokers: brokers.clone(),
        ..KafkaConfig::default()
    })
    .expect("producer config");

    let payload = serde_json::to_vec(&json!({ "user_id": "u-42" })).unwrap();
    let event = OutboxEvent::new("user", "u-42", "user.created", payload.clone(), "user-events")
        .with_partition_key("u-42");
    publisher.publish(&event).await.expect("publish");

    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", "sluice-test")
        .set("bootstrap.servers", &brokers)
        .set("auto.offset.reset", "earliest")
        .create()
        .expect("consumer config");
    consumer.subscribe(&["user-events"]).expect("subscribe");

    let message = tokio::time::timeout(Duration::from_secs(30), consumer.recv())
        .await
        .expect("message within timeout")
        .expect("receive");

    assert_eq!(message.key(), Some("u-42".as_bytes()));
    assert_eq!(message.payload(), Some(payload.as_slice()));

    let headers = message.headers().expect("headers present");
    let mut seen = std::collections::HashMap::new();
    for header in headers.iter() {
        seen.insert(
            header.key.to_string(),
            String::from_utf8_lossy(header.value.unwrap_or_default()).to_string(),
        );
    }
    assert_eq!(seen["event_id"], event.id.to_string());
    assert_eq!(seen["event_type"], "user.created");
    assert_eq!(seen["aggregate_type"], "user");
    assert_eq!(seen["aggregate_id"], "u-42");
    assert_eq!(seen["created_at"], event.created_at.to_rfc3339());
}

#[tokio::test]
#[ignore]
async fn publish_to_an_unreachable_broker_fails() {
    let publisher = KafkaPublisher::new(&KafkaConfig {
        brokers: "127.0.0.1:1".to_string(),
        message_timeout: Duration::from_secs(2),
        ..KafkaConfig::default()
    })
    .expect("producer config");

    let event = OutboxEvent::new("user", "u-1", "user.created", b"{}".to_vec(), "user-events");
    let err = publisher.publish(&event).await.expect_err("send must fail");
    assert!(err.to_string().contains("user-events"));
}
