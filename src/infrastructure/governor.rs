use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Concurrent request windows enforced against the brokerage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTag {
    PerSecond,
    PerMinute,
    PerHour,
}

pub const ALL_WINDOWS: [WindowTag; 3] = [
    WindowTag::PerSecond,
    WindowTag::PerMinute,
    WindowTag::PerHour,
];

struct WindowRing {
    tag: WindowTag,
    duration: Duration,
    cap: usize,
    stamps: VecDeque<Instant>,
}

impl WindowRing {
    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.stamps.front() {
            if front + self.duration <= now {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_slack(&self) -> bool {
        self.stamps.len() < self.cap
    }

    /// Time until the oldest stamp ages out of the trailing interval.
    fn wait_for_slack(&self, now: Instant) -> Duration {
        match self.stamps.front() {
            Some(&front) => (front + self.duration).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

/// Process-wide rate-limit governor.
///
/// `acquire` suspends the caller until every requested window has slack,
/// then records one timestamp per requested window. Waiters are admitted
/// FIFO: the admission mutex queues them in arrival order, and nobody
/// records a stamp while a prior waiter is still parked.
pub struct Governor {
    admission: tokio::sync::Mutex<()>,
    rings: Mutex<Vec<WindowRing>>,
}

impl Governor {
    pub fn new(config: &RateLimitConfig) -> Self {
        let rings = vec![
            WindowRing {
                tag: WindowTag::PerSecond,
                duration: Duration::from_secs(1),
                cap: config.per_sec as usize,
                stamps: VecDeque::new(),
            },
            WindowRing {
                tag: WindowTag::PerMinute,
                duration: Duration::from_secs(60),
                cap: config.per_min as usize,
                stamps: VecDeque::new(),
            },
            WindowRing {
                tag: WindowTag::PerHour,
                duration: Duration::from_secs(3600),
                cap: config.per_hour as usize,
                stamps: VecDeque::new(),
            },
        ];
        Self {
            admission: tokio::sync::Mutex::new(()),
            rings: Mutex::new(rings),
        }
    }

    /// Block until a slot is free in every requested window, then claim it.
    pub async fn acquire(&self, tags: &[WindowTag]) {
        let _ticket = self.admission.lock().await;

        loop {
            let wait = {
                let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                for ring in rings.iter_mut() {
                    ring.prune(now);
                }

                let blocked: Option<Duration> = rings
                    .iter()
                    .filter(|r| tags.contains(&r.tag) && !r.has_slack())
                    .map(|r| r.wait_for_slack(now))
                    .max();

                match blocked {
                    None => {
                        for ring in rings.iter_mut().filter(|r| tags.contains(&r.tag)) {
                            ring.stamps.push_back(now);
                        }
                        return;
                    }
                    Some(wait) => wait.max(Duration::from_millis(1)),
                }
            };

            debug!("Governor: window saturated, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a broker-side rate-limit response as a synthetic stamp in
    /// every window, making the local slack estimate more conservative.
    pub fn penalize(&self) {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        for ring in rings.iter_mut() {
            ring.prune(now);
            ring.stamps.push_back(now);
        }
    }

    /// Fraction of each window currently used, for metrics.
    pub fn saturation(&self) -> Vec<(WindowTag, f64)> {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        rings
            .iter_mut()
            .map(|ring| {
                ring.prune(now);
                let used = if ring.cap == 0 {
                    1.0
                } else {
                    ring.stamps.len() as f64 / ring.cap as f64
                };
                (ring.tag, used)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn governor(per_sec: u32, per_min: u32, per_hour: u32) -> Governor {
        Governor::new(&RateLimitConfig {
            per_sec,
            per_min,
            per_hour,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_cap_without_waiting() {
        let gov = governor(5, 100, 1500);
        let start = Instant::now();
        for _ in 0..5 {
            gov.acquire(&ALL_WINDOWS).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_acquire_waits_for_window() {
        let gov = governor(5, 100, 1500);
        for _ in 0..5 {
            gov.acquire(&ALL_WINDOWS).await;
        }
        let start = Instant::now();
        gov.acquire(&ALL_WINDOWS).await;
        // Must have waited for the 1s window to roll.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_never_exceeded() {
        // 1m cap of 10: 30 concurrent acquires must span >= 2 full minutes.
        let gov = Arc::new(governor(10, 10, 1500));
        let start = Instant::now();

        let handles: Vec<_> = (0..30)
            .map(|_| {
                let gov = gov.clone();
                tokio::spawn(async move {
                    gov.acquire(&ALL_WINDOWS).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_secs(120));
        let saturation = gov.saturation();
        let minute = saturation
            .iter()
            .find(|(tag, _)| *tag == WindowTag::PerMinute)
            .unwrap();
        assert!(minute.1 <= 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalize_consumes_slack() {
        let gov = governor(5, 100, 1500);
        for _ in 0..4 {
            gov.acquire(&ALL_WINDOWS).await;
        }
        gov.penalize();
        let start = Instant::now();
        gov.acquire(&ALL_WINDOWS).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_ordering_under_contention() {
        let gov = Arc::new(governor(1, 100, 1500));
        gov.acquire(&ALL_WINDOWS).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..4u32 {
            let gov = gov.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                gov.acquire(&ALL_WINDOWS).await;
                let _ = tx.send(i);
            });
            // Let each waiter reach the admission queue in order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(i) = rx.recv().await {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
