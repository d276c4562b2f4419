use crate::application::scheduler::jobs::{JobKind, JobTable, ScheduledJob};
use crate::application::trading::PERFORMANCE_FILE;
use crate::infrastructure::persistence::ArtifactStore;
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;
use tracing::info;

/// Determines catch-up work from the clock and on-disk artifacts.
///
/// Deterministic: the same artifacts and the same wall-clock reading
/// always produce the same plan. Jobs whose artifact is present and valid
/// for today are never re-run.
pub struct RecoveryManager {
    artifacts: Arc<ArtifactStore>,
    table: JobTable,
}

impl RecoveryManager {
    pub fn new(artifacts: Arc<ArtifactStore>, batches: usize) -> Self {
        Self {
            artifacts,
            table: JobTable::new(batches),
        }
    }

    /// Artifact-backed completion check. Jobs without artifacts
    /// (market open/close, cache flush) are never "done" on disk; their
    /// catch-up rules are time-based in `plan_catch_up`.
    pub fn is_done(&self, kind: JobKind, date: NaiveDate) -> bool {
        match kind {
            JobKind::Phase1 => self
                .artifacts
                .read_watchlist()
                .map(|snapshot| {
                    // The snapshot is stamped in UTC; the job table runs on
                    // local dates.
                    snapshot
                        .generated_at
                        .with_timezone(&chrono::Local)
                        .date_naive()
                        == date
                })
                .unwrap_or(false),
            JobKind::Phase2Batch(batch_id) => self.artifacts.read_batch(date, batch_id).is_ok(),
            JobKind::Phase2Finalize => self.artifacts.read_selection(date).is_ok(),
            JobKind::CloseOut => self
                .artifacts
                .read_day_json::<crate::application::trading::DailyPerformance>(
                    date,
                    PERFORMANCE_FILE,
                )
                .map(|p| p.run_date == date)
                .unwrap_or(false),
            JobKind::MarketOpen | JobKind::MarketClose | JobKind::CacheFlush => false,
        }
    }

    /// The ordered catch-up list for a process starting at `now`.
    ///
    /// Batches keep their original relative order; the trading loop is not
    /// a job here (the scheduler starts it whenever the clock is inside
    /// market hours); close-out is enqueued only after 16:00.
    pub fn plan_catch_up(&self, now: NaiveDateTime) -> Vec<JobKind> {
        let date = now.date();
        if !JobTable::is_trading_day(date) {
            return Vec::new();
        }

        let due: Vec<ScheduledJob> = self
            .table
            .jobs_for(date)
            .into_iter()
            .filter(|job| job.time <= now.time())
            .collect();

        let mut plan = Vec::new();
        for job in due {
            match job.kind {
                JobKind::Phase1 | JobKind::Phase2Batch(_) | JobKind::Phase2Finalize
                | JobKind::CloseOut => {
                    if !self.is_done(job.kind, date) {
                        plan.push(job.kind);
                    }
                }
                // Market open/close actions and the cache flush are
                // moment-in-time jobs; running them late is meaningless.
                JobKind::MarketOpen | JobKind::MarketClose | JobKind::CacheFlush => {}
            }
        }

        // Dependency order is the table's time order already: phase 1
        // before batches, batches before finalize, finalize before
        // close-out. A missing phase-1 artifact forces downstream re-runs
        // to follow it regardless of their own artifact state.
        if plan.contains(&JobKind::Phase1) {
            let date_jobs: Vec<JobKind> = self
                .table
                .jobs_for(date)
                .into_iter()
                .filter(|job| job.time <= now.time())
                .map(|job| job.kind)
                .filter(|kind| {
                    matches!(
                        kind,
                        JobKind::Phase2Batch(_) | JobKind::Phase2Finalize
                    )
                })
                .collect();
            for kind in date_jobs {
                if !plan.contains(&kind) {
                    plan.push(kind);
                }
            }
            // Keep table order after the merge.
            plan.sort_by_key(|kind| self.order_key(*kind));
        }

        if !plan.is_empty() {
            info!(
                "Recovery plan at {}: {}",
                now,
                plan.iter()
                    .map(|kind| kind.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        plan
    }

    fn order_key(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::CacheFlush => 0,
            JobKind::Phase1 => 1,
            JobKind::Phase2Batch(id) => 2 + id,
            JobKind::Phase2Finalize => 10_000,
            JobKind::MarketOpen => 10_001,
            JobKind::MarketClose => 10_002,
            JobKind::CloseOut => 10_003,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::selection::BatchArtifact;
    use crate::domain::watchlist::WatchlistSnapshot;
    use chrono::{NaiveTime, Utc};

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        date.and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap())
    }

    fn manager(dir: &tempfile::TempDir, batches: usize) -> RecoveryManager {
        RecoveryManager::new(Arc::new(ArtifactStore::new(dir.path())), batches)
    }

    fn stamp_for(date: NaiveDate) -> chrono::DateTime<Utc> {
        // Local noon on the given date, expressed in UTC, so the local-date
        // comparison holds in any test timezone.
        date.and_hms_opt(12, 0, 0)
            .unwrap()
            .and_local_timezone(chrono::Local)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn write_watchlist_for(store: &ArtifactStore, date: NaiveDate) {
        store
            .write_watchlist(&WatchlistSnapshot {
                generated_at: stamp_for(date),
                entries: Vec::new(),
            })
            .unwrap();
    }

    #[test]
    fn test_cold_start_mid_morning_plans_everything() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = manager(&dir, 18);

        let plan = recovery.plan_catch_up(at(monday(), 10, 17));
        // Phase 1, all 18 batches, finalize. Close-out not yet due.
        assert_eq!(plan.len(), 1 + 18 + 1);
        assert_eq!(plan[0], JobKind::Phase1);
        assert_eq!(plan[1], JobKind::Phase2Batch(0));
        assert_eq!(plan[18], JobKind::Phase2Batch(17));
        assert_eq!(plan[19], JobKind::Phase2Finalize);
        assert!(!plan.contains(&JobKind::CloseOut));
    }

    #[test]
    fn test_intact_artifacts_mean_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        write_watchlist_for(&store, monday());
        for batch_id in 0..4 {
            store
                .write_batch(&BatchArtifact::completed(batch_id, monday(), Vec::new()))
                .unwrap();
        }
        store
            .write_selection(&crate::domain::selection::SelectionSnapshot {
                run_date: monday(),
                regime: "sideways".to_string(),
                selections: Vec::new(),
                completed_at: Utc::now(),
            })
            .unwrap();

        let recovery = manager(&dir, 4);
        let plan = recovery.plan_catch_up(at(monday(), 10, 0));
        assert!(plan.is_empty(), "plan: {plan:?}");
    }

    #[test]
    fn test_partial_batches_resume_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        write_watchlist_for(&store, monday());
        // Batches 0 and 1 done; 2 and 3 missing.
        for batch_id in 0..2 {
            store
                .write_batch(&BatchArtifact::completed(batch_id, monday(), Vec::new()))
                .unwrap();
        }

        let recovery = manager(&dir, 4);
        let plan = recovery.plan_catch_up(at(monday(), 9, 30));
        assert_eq!(
            plan,
            vec![
                JobKind::Phase2Batch(2),
                JobKind::Phase2Batch(3),
                JobKind::Phase2Finalize,
            ]
        );
    }

    #[test]
    fn test_stale_watchlist_forces_full_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        // Watchlist stamped yesterday.
        let mut snapshot = WatchlistSnapshot {
            generated_at: Utc::now() - chrono::Duration::days(1),
            entries: Vec::new(),
        };
        snapshot.generated_at -= chrono::Duration::hours(1);
        store.write_watchlist(&snapshot).unwrap();
        // Today's batches are (stale-)present from a past run? They are
        // valid for today, but phase 1 rerun drags them back in.
        for batch_id in 0..2 {
            store
                .write_batch(&BatchArtifact::completed(batch_id, monday(), Vec::new()))
                .unwrap();
        }

        let recovery = manager(&dir, 2);
        let plan = recovery.plan_catch_up(at(monday(), 9, 0));
        assert_eq!(plan[0], JobKind::Phase1);
        assert!(plan.contains(&JobKind::Phase2Batch(0)));
        assert!(plan.contains(&JobKind::Phase2Batch(1)));
        assert!(plan.contains(&JobKind::Phase2Finalize));
    }

    #[test]
    fn test_before_first_job_plans_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = manager(&dir, 18);
        let plan = recovery.plan_catch_up(at(monday(), 5, 30));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_after_sixteen_adds_closeout() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = manager(&dir, 2);
        let plan = recovery.plan_catch_up(at(monday(), 17, 0));
        assert_eq!(*plan.last().unwrap(), JobKind::CloseOut);
    }

    #[test]
    fn test_weekend_plans_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = manager(&dir, 18);
        let saturday = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        let plan = recovery.plan_catch_up(at(saturday, 10, 0));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_determinism() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = manager(&dir, 18);
        let a = recovery.plan_catch_up(at(monday(), 11, 11));
        let b = recovery.plan_catch_up(at(monday(), 11, 11));
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_size_artifact_is_not_done() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        write_watchlist_for(&store, monday());
        let path = store.batch_path(monday(), 0);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"").unwrap();

        let recovery = manager(&dir, 1);
        assert!(!recovery.is_done(JobKind::Phase2Batch(0), monday()));
        let plan = recovery.plan_catch_up(at(monday(), 8, 0));
        assert!(plan.contains(&JobKind::Phase2Batch(0)));
    }
}
