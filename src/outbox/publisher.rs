//! The emission contract toward the downstream log.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::PublishError;
use crate::outbox::event::OutboxEvent;

/// Synchronous-in-effect emitter: one `Ok(())` means the log has accepted
/// and replicated exactly one message for this event (keyed by its
/// partitioning key, carrying its metadata as headers). An `Err` means the
/// caller should retry; the relay's bookkeeping takes it from there.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError>;
}

#[derive(Debug)]
enum FailureMode {
    Never,
    Always(String),
    Times(u32, String),
}

/// Publisher that records into memory. Tests use it to observe exactly
/// what the relay emitted, and can arm it to fail.
#[derive(Debug)]
pub struct MemoryPublisher {
    sent: Mutex<Vec<OutboxEvent>>,
    attempts: AtomicU32,
    mode: Mutex<FailureMode>,
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::with_mode(FailureMode::Never)
    }

    /// A publisher that rejects every event with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_mode(FailureMode::Always(message.into()))
    }

    /// A publisher that rejects the first `times` events, then recovers.
    pub fn failing_times(times: u32, message: impl Into<String>) -> Self {
        Self::with_mode(FailureMode::Times(times, message.into()))
    }

    fn with_mode(mode: FailureMode) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            mode: Mutex::new(mode),
        }
    }

    /// Everything successfully published, in order.
    pub fn sent(&self) -> Vec<OutboxEvent> {
        self.sent.lock().unwrap().clone()
    }

    /// Publish calls made, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut mode = self.mode.lock().unwrap();
            match &mut *mode {
                FailureMode::Never => {}
                FailureMode::Always(message) => {
                    return Err(PublishError::new(message.clone()));
                }
                FailureMode::Times(times, message) => {
                    if *times > 0 {
                        *times -= 1;
                        return Err(PublishError::new(message.clone()));
                    }
                }
            }
        }
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }
}
