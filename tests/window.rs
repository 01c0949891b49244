//! End-to-end sliding window scenarios against the in-memory engine.

use std::sync::Arc;
use std::time::Duration;

use sluice::clock::{Clock, ManualClock};
use sluice::limit::{Limiter, MemorySlidingWindow, WindowConfig};

fn engine(max: u64, window: Duration) -> (MemorySlidingWindow<ManualClock>, ManualClock) {
    let clock = ManualClock::new();
    clock.set(1_700_000_000_000_000);
    let engine = MemorySlidingWindow::with_clock(
        WindowConfig { window, max_requests: max, ttl: Duration::from_secs(300) },
        clock.clone(),
    )
    .expect("valid config");
    (engine, clock)
}

#[tokio::test]
async fn rolling_count_never_exceeds_max() {
    let (window, clock) = engine(5, Duration::from_secs(1));

    // Fire at 100ms spacing for three seconds; at every instant the count
    // of admissions inside the trailing second must stay within five.
    let mut admitted_at: Vec<u64> = Vec::new();
    for step in 0..30u64 {
        let now = clock.now_millis();
        if window.allow("k").await.unwrap().allowed {
            admitted_at.push(now);
        }
        let in_window =
            admitted_at.iter().filter(|&&at| at + 1_000 > now).count();
        assert!(in_window <= 5, "step {}: {} admissions inside the window", step, in_window);
        clock.advance(Duration::from_millis(100));
    }
    assert!(admitted_at.len() >= 10, "the window should keep admitting as old entries roll out");
}

#[tokio::test]
async fn admission_expires_at_exactly_the_window_edge() {
    let (window, clock) = engine(1, Duration::from_secs(1));
    assert!(window.allow("k").await.unwrap().allowed);

    clock.advance(Duration::from_millis(1_000));
    let decision = window.allow("k").await.unwrap();
    assert!(decision.allowed, "an admission exactly window ms old no longer counts");
}

#[tokio::test]
async fn hundred_workers_against_fifty_slots() {
    let (window, _) = engine(50, Duration::from_secs(1));
    let window = Arc::new(window);

    let mut handles = Vec::new();
    for _ in 0..100 {
        let window = Arc::clone(&window);
        handles.push(tokio::spawn(async move {
            window.allow("k").await.unwrap().allowed
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 50);
}

#[tokio::test]
async fn denial_reports_when_a_slot_frees_up() {
    let (window, clock) = engine(2, Duration::from_secs(10));
    window.allow("k").await.unwrap();
    clock.advance(Duration::from_secs(3));
    window.allow("k").await.unwrap();

    let decision = window.allow("k").await.unwrap();
    assert!(!decision.allowed);
    // the oldest admission is 3s old in a 10s window
    assert_eq!(decision.retry_after, Duration::from_secs(7));
    assert_eq!(decision.current_count, 2);
}

#[tokio::test]
async fn take_through_the_shared_contract() {
    let (window, _) = engine(3, Duration::from_secs(60));

    for remaining in [2.0, 1.0, 0.0] {
        let take = window.take("k", 1.0).await.unwrap();
        assert!(take.allowed);
        assert_eq!(take.remaining, remaining);
    }
    let take = window.take("k", 1.0).await.unwrap();
    assert!(!take.allowed);
    assert_eq!(take.remaining, 0.0);

    window.reset("k").await.unwrap();
    assert!(window.take("k", 1.0).await.unwrap().allowed);
}
