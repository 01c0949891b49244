//! Partition selection for logs that expose partition routing.
//!
//! A strategy maps `(event, partition count)` to a partition index. Equal
//! keys must land on the same partition, because the log's only ordering
//! guarantee is per partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use sha2::{Digest, Sha256};

use crate::outbox::event::OutboxEvent;

/// One-method capability: choose a partition for an event.
///
/// Implementations must return a value in `[0, partitions)` for positive
/// `partitions`, and `0` otherwise.
pub trait Partitioner: Send + Sync {
    fn partition(&self, event: &OutboxEvent, partitions: i32) -> i32;
}

/// Stable CRC-32 hash of the event's partitioning key (explicit key, else
/// aggregate id). Matches the routing a key-hashing log client would do
/// itself, so externally-computed and client-computed placements agree.
/// The default strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyHashPartitioner;

impl Partitioner for KeyHashPartitioner {
    fn partition(&self, event: &OutboxEvent, partitions: i32) -> i32 {
        if partitions <= 0 {
            return 0;
        }
        (crc32(event.partitioning_key().as_bytes()) % partitions as u32) as i32
    }
}

/// SHA-256 over the aggregate id, for smoother spread across hot
/// aggregates than CRC-32 gives.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateHashPartitioner;

impl Partitioner for AggregateHashPartitioner {
    fn partition(&self, event: &OutboxEvent, partitions: i32) -> i32 {
        if partitions <= 0 {
            return 0;
        }
        let digest = Sha256::digest(event.aggregate_id.as_bytes());
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (head % partitions as u32) as i32
    }
}

/// Even spread with no key affinity, for event kinds whose order is
/// irrelevant.
#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    next: AtomicU32,
}

impl RoundRobinPartitioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&self, _event: &OutboxEvent, partitions: i32) -> i32 {
        if partitions <= 0 {
            return 0;
        }
        (self.next.fetch_add(1, Ordering::Relaxed) % partitions as u32) as i32
    }
}

/// Dispatches to a registered strategy by event kind, with a fallback for
/// everything unregistered (key hash unless overridden).
pub struct EventTypePartitioner {
    routes: HashMap<String, Box<dyn Partitioner>>,
    fallback: Box<dyn Partitioner>,
}

impl Default for EventTypePartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTypePartitioner {
    pub fn new() -> Self {
        Self { routes: HashMap::new(), fallback: Box::new(KeyHashPartitioner) }
    }

    /// Route `event_type` through `strategy`.
    pub fn route(
        mut self,
        event_type: impl Into<String>,
        strategy: impl Partitioner + 'static,
    ) -> Self {
        self.routes.insert(event_type.into(), Box::new(strategy));
        self
    }

    /// Replace the fallback strategy.
    pub fn fallback(mut self, strategy: impl Partitioner + 'static) -> Self {
        self.fallback = Box::new(strategy);
        self
    }
}

impl Partitioner for EventTypePartitioner {
    fn partition(&self, event: &OutboxEvent, partitions: i32) -> i32 {
        match self.routes.get(&event.event_type) {
            Some(strategy) => strategy.partition(event, partitions),
            None => self.fallback.partition(event, partitions),
        }
    }
}

/// CRC-32/IEEE (reflected, polynomial `0xEDB88320`), bit-at-a-time.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = u32::MAX;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(aggregate_id: &str) -> OutboxEvent {
        OutboxEvent::new("user", aggregate_id, "user.created", vec![], "users")
    }

    #[test]
    fn crc32_matches_the_reference_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn key_hash_is_deterministic_and_in_range() {
        let strategy = KeyHashPartitioner;
        for id in ["u-1", "u-2", "tenant-42", "x"] {
            let e = event(id);
            let first = strategy.partition(&e, 12);
            assert!((0..12).contains(&first));
            assert_eq!(strategy.partition(&e, 12), first);
        }
    }

    #[test]
    fn key_hash_honors_the_explicit_partition_key() {
        let strategy = KeyHashPartitioner;
        let plain = event("u-1");
        let keyed = event("u-2").with_partition_key("u-1");
        assert_eq!(strategy.partition(&plain, 16), strategy.partition(&keyed, 16));
    }

    #[test]
    fn aggregate_hash_is_deterministic_and_in_range() {
        let strategy = AggregateHashPartitioner;
        let e = event("u-1");
        let first = strategy.partition(&e, 7);
        assert!((0..7).contains(&first));
        assert_eq!(strategy.partition(&e, 7), first);
    }

    #[test]
    fn round_robin_cycles_through_partitions() {
        let strategy = RoundRobinPartitioner::new();
        let e = event("u-1");
        let picks: Vec<i32> = (0..6).map(|_| strategy.partition(&e, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn non_positive_partition_counts_map_to_zero() {
        let e = event("u-1");
        assert_eq!(KeyHashPartitioner.partition(&e, 0), 0);
        assert_eq!(AggregateHashPartitioner.partition(&e, -3), 0);
        assert_eq!(RoundRobinPartitioner::new().partition(&e, 0), 0);
    }

    #[test]
    fn event_type_dispatch_with_fallback() {
        let strategy = EventTypePartitioner::new()
            .route("audit.logged", RoundRobinPartitioner::new());

        let mut audit = event("u-1");
        audit.event_type = "audit.logged".to_string();
        // round robin from zero
        assert_eq!(strategy.partition(&audit, 4), 0);
        assert_eq!(strategy.partition(&audit, 4), 1);

        // unregistered kinds go through the key-hash fallback
        let plain = event("u-1");
        assert_eq!(strategy.partition(&plain, 4), KeyHashPartitioner.partition(&plain, 4));
    }
}
