//! Pluggable waiting, so the relay's poll loop can be driven in tests
//! without real delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction over "wait this long".
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns immediately. Lets loop-shaped tests run at full speed.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Records every requested delay without waiting. Useful for asserting the
/// relay's poll and backoff cadence.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    requested: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<Duration> {
        self.requested.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.requested.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn instant_sleeper_returns_immediately() {
        let start = Instant::now();
        InstantSleeper.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn recording_sleeper_captures_delays() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_secs(5)).await;
        sleeper.sleep(Duration::from_secs(10)).await;
        assert_eq!(
            sleeper.requested(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[tokio::test]
    async fn tokio_sleeper_waits() {
        let start = Instant::now();
        TokioSleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
