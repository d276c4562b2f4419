//! Recovery scenarios: a catch-up plan is consumed by running jobs and
//! writing their artifacts; a subsequent restart plans nothing.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use kquant::application::scheduler::{JobKind, RecoveryManager};
use kquant::domain::selection::{BatchArtifact, SelectionSnapshot};
use kquant::domain::watchlist::WatchlistSnapshot;
use kquant::infrastructure::persistence::ArtifactStore;
use std::sync::Arc;

fn monday_at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 2)
        .unwrap()
        .and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap())
}

/// Pretend-run a job by writing the artifact the real job would write.
/// The watchlist stamp is local noon of the target date so the local-date
/// doneness check holds in any test timezone.
fn complete(store: &ArtifactStore, kind: JobKind, date: NaiveDate) {
    match kind {
        JobKind::Phase1 => store
            .write_watchlist(&WatchlistSnapshot {
                generated_at: date
                    .and_hms_opt(12, 0, 0)
                    .unwrap()
                    .and_local_timezone(chrono::Local)
                    .unwrap()
                    .with_timezone(&Utc),
                entries: Vec::new(),
            })
            .unwrap(),
        JobKind::Phase2Batch(batch_id) => store
            .write_batch(&BatchArtifact::completed(batch_id, date, Vec::new()))
            .unwrap(),
        JobKind::Phase2Finalize => store
            .write_selection(&SelectionSnapshot {
                run_date: date,
                regime: "sideways".to_string(),
                selections: Vec::new(),
                completed_at: Utc::now(),
            })
            .unwrap(),
        other => panic!("not an artifact-backed job: {other}"),
    }
}

#[test]
fn cold_start_mid_morning_catches_up_then_plans_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArtifactStore::new(dir.path()));
    let recovery = RecoveryManager::new(store.clone(), 18);

    let now = monday_at(10, 17);
    let plan = recovery.plan_catch_up(now);

    // Phase 1, batches 0..=17 in original order, then finalize; the
    // trading loop is the scheduler's business, close-out is not due yet.
    assert_eq!(plan.len(), 20);
    assert_eq!(plan[0], JobKind::Phase1);
    for (i, kind) in plan[1..19].iter().enumerate() {
        assert_eq!(*kind, JobKind::Phase2Batch(i));
    }
    assert_eq!(plan[19], JobKind::Phase2Finalize);

    // Back-to-back execution, artifact per job.
    for kind in &plan {
        complete(&store, *kind, now.date());
    }

    // A second restart at the same clock reading replans nothing.
    assert!(recovery.plan_catch_up(now).is_empty());
}

#[test]
fn restart_after_partial_phase2_resumes_where_left_off() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArtifactStore::new(dir.path()));
    let recovery = RecoveryManager::new(store.clone(), 6);
    let now = monday_at(11, 0);
    let date = now.date();

    complete(&store, JobKind::Phase1, date);
    for batch_id in 0..3 {
        complete(&store, JobKind::Phase2Batch(batch_id), date);
    }

    let plan = recovery.plan_catch_up(now);
    assert_eq!(
        plan,
        vec![
            JobKind::Phase2Batch(3),
            JobKind::Phase2Batch(4),
            JobKind::Phase2Batch(5),
            JobKind::Phase2Finalize,
        ]
    );
}

#[test]
fn late_start_includes_close_out_after_sixteen() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArtifactStore::new(dir.path()));
    let recovery = RecoveryManager::new(store.clone(), 2);
    let now = monday_at(16, 30);
    let date = now.date();

    complete(&store, JobKind::Phase1, date);
    complete(&store, JobKind::Phase2Batch(0), date);
    complete(&store, JobKind::Phase2Batch(1), date);
    complete(&store, JobKind::Phase2Finalize, date);

    let plan = recovery.plan_catch_up(now);
    assert_eq!(plan, vec![JobKind::CloseOut]);
}

#[test]
fn yesterdays_artifacts_do_not_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArtifactStore::new(dir.path()));
    let recovery = RecoveryManager::new(store.clone(), 2);
    let now = monday_at(9, 0);
    let friday = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();

    // Friday's batch artifacts exist under Friday's directory; Monday's
    // slots are empty, so everything is due again.
    complete(&store, JobKind::Phase2Batch(0), friday);
    complete(&store, JobKind::Phase2Batch(1), friday);

    let plan = recovery.plan_catch_up(now);
    assert!(plan.contains(&JobKind::Phase1));
    assert!(plan.contains(&JobKind::Phase2Batch(0)));
    assert!(plan.contains(&JobKind::Phase2Batch(1)));
}
