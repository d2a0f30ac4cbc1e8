//! Claim Semantics Integration Tests
//!
//! Exclusive claims, lock guards and stale-lock recovery on the SQLite store.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, TempDb, HOUR_MS, NOW};
use conveyor_core::application::{EscalationRouter, LockReaper};
use conveyor_core::domain::{Channel, JobPayload, JobState, JobType, NewJob, Queue};
use conveyor_core::error::AppError;
use conveyor_core::port::time_provider::SystemTimeProvider;
use conveyor_core::port::{JobStore, TimeProvider};
use conveyor_infra_sqlite::SqliteJobStore;

fn job(queue: Queue, scheduled_at: i64) -> NewJob {
    NewJob::new(queue, JobType::new("test.job"), JobPayload::empty(), scheduled_at)
}

#[tokio::test]
async fn test_enqueue_claim_then_second_claim_gets_nothing() {
    let h = Harness::new().await;
    let id = h.enqueue(Queue::Urgent).await;

    let claimed = h.store.claim_next(Queue::Urgent, "w1").await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.state, JobState::Running);
    assert_eq!(claimed.lock_owner.as_deref(), Some("w1"));
    assert_eq!(claimed.lock_time, Some(NOW));

    assert!(h.store.claim_next(Queue::Urgent, "w2").await.unwrap().is_none());
}

/// Many workers on separate connections never share a row
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    const JOBS: usize = 40;
    const WORKERS: usize = 8;

    let db = TempDb::new().await;
    let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let store = Arc::new(SqliteJobStore::new(db.pool.clone(), time.clone()));

    let now = time.now_millis();
    for _ in 0..JOBS {
        store.enqueue(job(Queue::Feeds, now)).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..WORKERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let mut mine = Vec::new();
            while let Some(job) = store.claim_next(Queue::Feeds, &worker_id).await.unwrap() {
                assert_eq!(job.lock_owner.as_deref(), Some(worker_id.as_str()));
                mine.push(job.id);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), JOBS, "every job claimed exactly once");
    assert_eq!(unique.len(), JOBS);
    assert_eq!(
        store
            .count_by_state(Queue::Feeds, JobState::Running)
            .await
            .unwrap(),
        JOBS as i64
    );
}

#[tokio::test]
async fn test_due_time_and_priority_order() {
    let h = Harness::new().await;
    let later = h.store.enqueue(job(Queue::Default, NOW - 1_000)).await.unwrap();
    let earlier = h.store.enqueue(job(Queue::Default, NOW - 9_000)).await.unwrap();
    let urgent = h
        .store
        .enqueue(job(Queue::Default, NOW).with_priority(-5))
        .await
        .unwrap();
    h.store
        .enqueue(job(Queue::Default, NOW + HOUR_MS))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = h.store.claim_next(Queue::Default, "w").await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![urgent, earlier, later]);
}

#[tokio::test]
async fn test_stale_lock_takeover_rejects_old_owner() {
    let h = Harness::new().await;
    let store = SqliteJobStore::new(h.pool.clone(), h.clock.clone())
        .with_stale_lock_timeout(Duration::from_secs(600));
    let id = store.enqueue(job(Queue::MarketData, NOW)).await.unwrap();
    store.claim_next(Queue::MarketData, "crashed").await.unwrap();

    h.clock.advance_millis(599_000);
    assert!(store.claim_next(Queue::MarketData, "w2").await.unwrap().is_none());

    h.clock.advance_millis(2_000);
    let taken = store.claim_next(Queue::MarketData, "w2").await.unwrap().unwrap();
    assert_eq!(taken.id, id);
    assert_eq!(taken.attempts, 1);

    let err = store.complete(id, "crashed").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = store.reschedule(id, "crashed", NOW, "late").await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    store.complete(id, "w2").await.unwrap();
    assert_eq!(h.job(id).await.state, JobState::Completed);
}

fn reaper(h: &Harness, store: Arc<SqliteJobStore>) -> LockReaper {
    LockReaper::new(
        store,
        Arc::new(EscalationRouter::new(h.notifier.clone())),
        h.telemetry.clone(),
        Duration::from_secs(60),
    )
}

/// A job that takes its worker down on every run still terminates
#[tokio::test]
async fn test_crash_looping_job_ends_failed_and_escalated() {
    let h = Harness::new().await;
    let store = Arc::new(
        SqliteJobStore::new(h.pool.clone(), h.clock.clone())
            .with_stale_lock_timeout(Duration::from_secs(60)),
    );
    let id = store.enqueue(job(Queue::Urgent, NOW)).await.unwrap();
    let reaper = reaper(&h, store.clone());

    let mut executions = 0;
    for round in 0..20 {
        reaper.sweep().await.unwrap();
        if store
            .claim_next(Queue::Urgent, &format!("worker-{round}"))
            .await
            .unwrap()
            .is_none()
        {
            break;
        }
        executions += 1;
        h.clock.advance_millis(61_000);
    }
    assert_eq!(executions, 5);

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, job.max_attempts);
    assert_eq!(job.last_error.as_deref(), Some("lock expired, worker lost: worker-4"));

    let escalations = h.notifier.escalations();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].job_id, id);
    assert_eq!(escalations[0].policy.channel, Channel::Pager);
}

#[tokio::test]
async fn test_reaper_returns_abandoned_claims() {
    let h = Harness::new().await;
    let store = Arc::new(
        SqliteJobStore::new(h.pool.clone(), h.clock.clone())
            .with_stale_lock_timeout(Duration::from_secs(60)),
    );
    let abandoned = store.enqueue(job(Queue::Background, NOW)).await.unwrap();
    store.claim_next(Queue::Background, "old-process").await.unwrap();

    h.clock.advance_millis(HOUR_MS);
    let reaper = reaper(&h, store.clone());
    let reclaimed = reaper.sweep().await.unwrap();

    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].job_id, abandoned);
    assert_eq!(reclaimed[0].previous_owner, "old-process");
    assert!(!reclaimed[0].exhausted);

    let job = h.job(abandoned).await;
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.lock_owner.is_none());
    assert!(h.notifier.escalations().is_empty());

    // Second sweep finds nothing
    assert!(reaper.sweep().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_jobs_survive_reopen() {
    let db = TempDb::new().await;
    let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let id = SqliteJobStore::new(db.pool.clone(), time.clone())
        .enqueue(job(Queue::Default, time.now_millis()))
        .await
        .unwrap();
    db.pool.close().await;

    let pool = conveyor_infra_sqlite::create_pool(&format!("sqlite://{}", db.path.display()))
        .await
        .unwrap();
    conveyor_infra_sqlite::run_migrations(&pool).await.unwrap();
    let reopened = SqliteJobStore::new(pool, time);

    let job = reopened.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
}
