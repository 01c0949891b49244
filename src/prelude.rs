//! One-stop imports for the common surface.

pub use crate::backoff::Backoff;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::error::{LimitError, PublishError, StoreError};
pub use crate::limit::{
    client_key, BucketConfig, BucketState, LimitState, Limiter, MemorySlidingWindow,
    MemoryTokenBucket, PeerAddr, RateLimitLayer, Take, WindowConfig, WindowDecision,
};
pub use crate::outbox::{
    EventStatus, KeyHashPartitioner, MemoryOutbox, MemoryPublisher, OutboxEvent, OutboxStore,
    Partitioner, Publisher, Relay, RelayConfig,
};
pub use crate::sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
