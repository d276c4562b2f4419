//! Rate-limit storm scenario: many concurrent quote requests must never
//! exceed any window cap, and the run must take as long as the budget
//! implies.

use kquant::config::RateLimitConfig;
use kquant::infrastructure::governor::{Governor, WindowTag, ALL_WINDOWS};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn storm_never_exceeds_minute_cap() {
    // 1m cap of 100, storm of 500: at least five windows of wall clock.
    let governor = Arc::new(Governor::new(&RateLimitConfig {
        per_sec: 1000,
        per_min: 100,
        per_hour: 100_000,
    }));
    let issue_log: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    let handles: Vec<_> = (0..500)
        .map(|_| {
            let governor = governor.clone();
            let issue_log = issue_log.clone();
            tokio::spawn(async move {
                governor.acquire(&[WindowTag::PerMinute, WindowTag::PerHour]).await;
                issue_log.lock().unwrap().push(Instant::now());
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = start.elapsed();
    let log = issue_log.lock().unwrap();
    assert_eq!(log.len(), 500, "all requests complete");

    // Total time: the fifth hundred can only start after four full
    // windows have rolled past.
    assert!(
        elapsed >= Duration::from_secs(4 * 60),
        "completed too fast: {elapsed:?}"
    );

    // Sliding-window check: no 60-second interval contains more than 100
    // issue timestamps.
    let mut window: VecDeque<Instant> = VecDeque::new();
    for &stamp in log.iter() {
        window.push_back(stamp);
        while let Some(&front) = window.front() {
            if stamp.duration_since(front) >= Duration::from_secs(60) {
                window.pop_front();
            } else {
                break;
            }
        }
        assert!(
            window.len() <= 100,
            "window holds {} issues at {:?}",
            window.len(),
            stamp
        );
    }
}

#[tokio::test(start_paused = true)]
async fn second_window_paces_bursts() {
    let governor = Governor::new(&RateLimitConfig {
        per_sec: 5,
        per_min: 1000,
        per_hour: 100_000,
    });

    let start = Instant::now();
    for _ in 0..20 {
        governor.acquire(&ALL_WINDOWS).await;
    }
    // 20 acquires at 5/s: the last five start after three windows rolled.
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn conservative_preset_caps_hold() {
    // The alternate documented regime (80/min) must be honored when active.
    let governor = Arc::new(Governor::new(&RateLimitConfig {
        per_sec: 1000,
        per_min: 80,
        per_hour: 1200,
    }));
    let start = Instant::now();
    let handles: Vec<_> = (0..160)
        .map(|_| {
            let governor = governor.clone();
            tokio::spawn(async move {
                governor.acquire(&[WindowTag::PerMinute]).await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(start.elapsed() >= Duration::from_secs(60));
}
