//! Wall-clock scheduler and crash recovery.

pub mod jobs;
pub mod recovery;

pub use jobs::{JobKind, JobTable, ScheduledJob, MARKET_CLOSE, MARKET_OPEN};
pub use recovery::RecoveryManager;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// One Phase-2 batch may not run longer than this.
const BATCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// The whole Phase-2 catch-up chain is bounded end to end.
const PHASE2_TIMEOUT: Duration = Duration::from_secs(90 * 60);
/// Generous bound for any other single job.
const JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const SCHEDULER_TICK: Duration = Duration::from_secs(20);
const TRADING_TICK: Duration = Duration::from_secs(60);

/// The scheduler drives everything through this seam; the production
/// implementation wires phase 1, phase 2, the trading engine, close-out,
/// and the cache flush.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, kind: JobKind, date: NaiveDate) -> Result<()>;
    /// One trading-loop iteration; called repeatedly during market hours.
    async fn trading_tick(&self, date: NaiveDate) -> Result<()>;
}

/// Jobs scheduled strictly after `last` and at or before `now`. A window
/// wrapping midnight (`now < last`) covers the tail of the old day and
/// the head of the new one, so the 00:00 flush is never skipped.
pub fn jobs_due_between(
    table: &JobTable,
    date: NaiveDate,
    last: NaiveTime,
    now: NaiveTime,
) -> Vec<ScheduledJob> {
    table
        .jobs_for(date)
        .into_iter()
        .filter(|job| {
            if now >= last {
                job.time > last && job.time <= now
            } else {
                job.time > last || job.time <= now
            }
        })
        .collect()
}

/// Single scheduler loop; jobs run through the executor while the
/// scheduler itself remains the only writer of scheduling state.
pub struct Scheduler {
    executor: Arc<dyn JobExecutor>,
    recovery: RecoveryManager,
    table: JobTable,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn JobExecutor>, recovery: RecoveryManager, batches: usize) -> Self {
        Self {
            executor,
            recovery,
            table: JobTable::new(batches),
        }
    }

    /// Run until the shutdown signal flips. Catch-up first, then the
    /// periodic loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.catch_up(Local::now().naive_local()).await?;

        let mut last_tick = Local::now().naive_local().time();
        let mut last_trading_tick = std::time::Instant::now() - TRADING_TICK;

        loop {
            if *shutdown.borrow() {
                info!("Scheduler: shutdown requested, stopping");
                return Ok(());
            }

            let now = Local::now().naive_local();
            let date = now.date();

            for job in jobs_due_between(&self.table, date, last_tick, now.time()) {
                // Artifact-backed jobs re-check disk so a job never runs
                // twice against an intact artifact.
                if self.recovery.is_done(job.kind, date) {
                    continue;
                }
                self.run_job(job.kind, date).await;
            }
            last_tick = now.time();

            if JobTable::is_trading_day(date)
                && JobTable::is_market_hours(now.time())
                && last_trading_tick.elapsed() >= TRADING_TICK
            {
                last_trading_tick = std::time::Instant::now();
                if let Err(e) = self.executor.trading_tick(date).await {
                    warn!("Trading tick failed: {e:#}");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(SCHEDULER_TICK) => {}
            }
        }
    }

    /// On start: enqueue everything the recovery manager says is missing,
    /// in dependency order, back to back.
    async fn catch_up(&self, now: NaiveDateTime) -> Result<()> {
        let plan = self.recovery.plan_catch_up(now);
        if plan.is_empty() {
            info!("Recovery: nothing to catch up at {now}");
            return Ok(());
        }
        info!("Recovery: catching up {} jobs", plan.len());

        let phase2_deadline = std::time::Instant::now() + PHASE2_TIMEOUT;
        for kind in plan {
            if matches!(kind, JobKind::Phase2Batch(_) | JobKind::Phase2Finalize)
                && std::time::Instant::now() > phase2_deadline
            {
                error!("Phase 2 catch-up exceeded {:?}, abandoning {kind}", PHASE2_TIMEOUT);
                break;
            }
            self.run_job(kind, now.date()).await;
        }
        Ok(())
    }

    async fn run_job(&self, kind: JobKind, date: NaiveDate) {
        let timeout = match kind {
            JobKind::Phase2Batch(_) => BATCH_TIMEOUT,
            _ => JOB_TIMEOUT,
        };
        info!("Scheduler: running {kind}");
        let started = std::time::Instant::now();
        match tokio::time::timeout(timeout, self.executor.execute(kind, date)).await {
            Ok(Ok(())) => info!("Scheduler: {kind} done in {:?}", started.elapsed()),
            Ok(Err(e)) => error!("Scheduler: {kind} failed: {e:#}"),
            Err(_) => error!("Scheduler: {kind} timed out after {timeout:?}"),
        }
    }
}
