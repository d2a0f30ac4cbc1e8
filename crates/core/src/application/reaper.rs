// Stale lock recovery: settles claims abandoned by crashed workers
use crate::application::dispatcher::ShutdownToken;
use crate::application::escalation::EscalationRouter;
use crate::error::Result;
use crate::port::telemetry::counters;
use crate::port::{JobEvent, JobEventKind, JobStore, StaleClaim, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Lock reaper
///
/// A worker that crashed mid-job leaves its row RUNNING with an old lock.
/// Claims already take such rows over; the reaper additionally sweeps them
/// at startup and on a fixed period. The abandoned execution costs one
/// attempt, so a job that kills its worker every time still ends FAILED.
/// The reaper escalates the jobs it moved to FAILED.
pub struct LockReaper {
    store: Arc<dyn JobStore>,
    escalation: Arc<EscalationRouter>,
    telemetry: Arc<dyn TelemetrySink>,
    interval: Duration,
}

impl LockReaper {
    /// Create a new lock reaper
    ///
    /// # Arguments
    /// * `store` - Job store (owns the stale-lock timeout)
    /// * `interval` - Period of the background sweep
    pub fn new(
        store: Arc<dyn JobStore>,
        escalation: Arc<EscalationRouter>,
        telemetry: Arc<dyn TelemetrySink>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            escalation,
            telemetry,
            interval,
        }
    }

    /// One sweep; returns the settled claims
    pub async fn sweep(&self) -> Result<Vec<StaleClaim>> {
        let reclaimed = self.store.reclaim_stale_locks().await?;
        for claim in &reclaimed {
            warn!(
                job_id = claim.job_id,
                previous_owner = %claim.previous_owner,
                locked_at = claim.locked_at,
                exhausted = claim.exhausted,
                "Reclaimed stale lock"
            );
            if claim.exhausted {
                self.escalate(claim).await;
            }
        }
        if !reclaimed.is_empty() {
            info!(reclaimed_count = reclaimed.len(), "Stale lock sweep complete");
        }
        Ok(reclaimed)
    }

    async fn escalate(&self, claim: &StaleClaim) {
        let job = match self.store.find_by_id(claim.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = claim.job_id, "Exhausted job vanished before escalation");
                return;
            }
            Err(e) => {
                error!(job_id = claim.job_id, error = %e, "Failed to load exhausted job");
                return;
            }
        };
        let reason = job.last_error.clone().unwrap_or_default();

        self.telemetry.emit(&JobEvent {
            kind: JobEventKind::Exhausted,
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue: job.queue,
            attempt: job.attempts,
            detail: Some(reason.clone()),
        });
        self.telemetry
            .increment(counters::JOBS_EXHAUSTED, job.queue.as_str(), 1);
        error!(
            job_id = job.id,
            queue = %job.queue,
            attempts = job.attempts,
            error = %reason,
            "Job failed after its worker was lost"
        );

        if let Err(e) = self.escalation.escalate(&job, &reason).await {
            error!(job_id = job.id, error = %e, "Escalation failed");
        }
    }

    /// Sweep periodically until shutdown
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Stale lock sweep failed");
            }
        }
        info!("Lock reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Channel, JobPayload, JobState, JobType, NewJob, Queue};
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::notifier::mocks::RecordingNotifier;
    use crate::port::telemetry::mocks::RecordingTelemetry;
    use crate::port::time_provider::mocks::ManualClock;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryJobStore>,
        notifier: Arc<RecordingNotifier>,
        telemetry: Arc<RecordingTelemetry>,
        reaper: LockReaper,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(InMemoryJobStore::new(clock.clone()).with_stale_lock_timeout_ms(60_000));
        let notifier = Arc::new(RecordingNotifier::new());
        let telemetry = Arc::new(RecordingTelemetry::new());
        let reaper = LockReaper::new(
            store.clone(),
            Arc::new(EscalationRouter::new(notifier.clone())),
            telemetry.clone(),
            Duration::from_secs(60),
        );
        Fixture {
            clock,
            store,
            notifier,
            telemetry,
            reaper,
        }
    }

    fn new_job(queue: Queue) -> NewJob {
        NewJob::new(queue, JobType::new("t"), JobPayload::empty(), 0)
    }

    #[tokio::test]
    async fn test_sweep_releases_only_stale_locks() {
        let f = fixture();
        let crashed = f.store.enqueue(new_job(Queue::Default)).await.unwrap();
        f.store.claim_next(Queue::Default, "dead-worker").await.unwrap();
        f.clock.advance_millis(120_000);

        // More urgent than the stale row, so the live worker takes this one
        let alive = f
            .store
            .enqueue(new_job(Queue::Default).with_priority(-1))
            .await
            .unwrap();
        let claimed = f.store.claim_next(Queue::Default, "live-worker").await.unwrap();
        assert_eq!(claimed.unwrap().id, alive);

        let reclaimed = f.reaper.sweep().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].job_id, crashed);
        assert_eq!(reclaimed[0].previous_owner, "dead-worker");
        assert!(!reclaimed[0].exhausted);

        let job = f.store.get(crashed).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("lock expired, worker lost: dead-worker"));
        assert!(job.lock_owner.is_none());
        assert_eq!(f.store.get(alive).unwrap().state, JobState::Running);
        assert!(f.notifier.escalations().is_empty());

        assert!(f.reaper.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_lost_attempt_fails_and_escalates_once() {
        let f = fixture();
        let id = f
            .store
            .enqueue(new_job(Queue::Screenshots).with_max_attempts(2))
            .await
            .unwrap();

        f.store.claim_next(Queue::Screenshots, "w1").await.unwrap();
        f.clock.advance_millis(61_000);
        let taken = f.store.claim_next(Queue::Screenshots, "w2").await.unwrap().unwrap();
        assert_eq!(taken.attempts, 1);
        f.clock.advance_millis(61_000);

        // No attempt left: the stale row is not claimable any more
        assert!(f.store.claim_next(Queue::Screenshots, "w3").await.unwrap().is_none());

        let reclaimed = f.reaper.sweep().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert!(reclaimed[0].exhausted);

        let job = f.store.get(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);

        let escalations = f.notifier.escalations();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].job_id, id);
        assert_eq!(escalations[0].attempts, 2);
        assert_eq!(escalations[0].policy.channel, Channel::EmailDigest);

        let exhausted: Vec<_> = f
            .telemetry
            .events()
            .into_iter()
            .filter(|e| e.kind == JobEventKind::Exhausted)
            .collect();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(
            f.telemetry
                .snapshot()
                .counter_for(counters::JOBS_EXHAUSTED, "screenshots"),
            1
        );

        assert!(f.reaper.sweep().await.unwrap().is_empty());
        assert_eq!(f.notifier.escalations().len(), 1);
    }
}
