// Job Store Port (Interface)

use crate::domain::{Job, JobId, JobState, NewJob, Queue};
use crate::error::Result;
use async_trait::async_trait;

/// Prefix of `last_error` for an execution whose worker stopped holding its lock
pub const STALE_LOCK_ERROR: &str = "lock expired, worker lost: ";

pub fn stale_lock_error(previous_owner: &str) -> String {
    format!("{STALE_LOCK_ERROR}{previous_owner}")
}

/// A RUNNING job whose lock outlived the stale-lock timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleClaim {
    pub job_id: JobId,
    pub previous_owner: String,
    pub locked_at: i64,
    /// The abandoned execution used up the last attempt; the job is now FAILED
    pub exhausted: bool,
}

/// Durable job table with atomic claim semantics
///
/// Every mutation after `claim_next` is guarded by `worker_id`: if the lock
/// no longer belongs to the caller the store returns `AppError::Conflict`
/// and changes nothing.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new PENDING job, returns the assigned id
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    /// Atomically claim the most urgent due job of `queue`
    ///
    /// Order: lowest priority value, then earliest `scheduled_at`. Rows held
    /// by a live lock are skipped, never waited on. Rows whose lock is older
    /// than the stale-lock timeout are taken over and charged one attempt for
    /// the abandoned execution; a stale row with no attempt left is skipped
    /// and left to `reclaim_stale_locks`.
    async fn claim_next(&self, queue: Queue, worker_id: &str) -> Result<Option<Job>>;

    /// RUNNING -> COMPLETED, clears the lock
    async fn complete(&self, id: JobId, worker_id: &str) -> Result<()>;

    /// RUNNING -> PENDING at `next_attempt_at`, increments attempts, records error
    async fn reschedule(
        &self,
        id: JobId,
        worker_id: &str,
        next_attempt_at: i64,
        error: &str,
    ) -> Result<()>;

    /// RUNNING -> FAILED (terminal), attempts capped at max_attempts
    async fn mark_failed(&self, id: JobId, worker_id: &str, error: &str) -> Result<()>;

    /// RUNNING -> PENDING, scheduled_at and attempts untouched
    async fn release_without_penalty(&self, id: JobId, worker_id: &str) -> Result<()>;

    /// Settle every stale RUNNING row, charging the abandoned execution one attempt
    ///
    /// Rows with attempts left go back to PENDING at their original due
    /// time; rows without go to FAILED and come back with `exhausted` set.
    async fn reclaim_stale_locks(&self) -> Result<Vec<StaleClaim>>;

    /// Find job by ID
    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>>;

    /// Count jobs by state
    async fn count_by_state(&self, queue: Queue, state: JobState) -> Result<i64>;
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use crate::port::TimeProvider;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// In-memory job store with the same claim and guard rules as the SQL stores
    pub struct InMemoryJobStore {
        jobs: Mutex<BTreeMap<JobId, Job>>,
        time_provider: Arc<dyn TimeProvider>,
        stale_lock_timeout_ms: i64,
        fail_claims: Mutex<bool>,
    }

    impl InMemoryJobStore {
        pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
            Self {
                jobs: Mutex::new(BTreeMap::new()),
                time_provider,
                stale_lock_timeout_ms: 15 * 60 * 1000,
                fail_claims: Mutex::new(false),
            }
        }

        pub fn with_stale_lock_timeout_ms(mut self, timeout_ms: i64) -> Self {
            self.stale_lock_timeout_ms = timeout_ms;
            self
        }

        /// Make every subsequent claim fail with a database error
        pub fn set_fail_claims(&self, fail: bool) {
            if let Ok(mut flag) = self.fail_claims.lock() {
                *flag = fail;
            }
        }

        pub fn get(&self, id: JobId) -> Option<Job> {
            self.lock().get(&id).cloned()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<JobId, Job>> {
            match self.jobs.lock() {
                Ok(jobs) => jobs,
                Err(poisoned) => poisoned.into_inner(),
            }
        }

        fn is_stale(&self, job: &Job, now: i64) -> bool {
            job.state == JobState::Running
                && job
                    .lock_time
                    .is_some_and(|t| t < now - self.stale_lock_timeout_ms)
        }

        fn with_owned<T>(
            &self,
            id: JobId,
            worker_id: &str,
            next: JobState,
            f: impl FnOnce(&mut Job) -> T,
        ) -> Result<T> {
            let mut jobs = self.lock();
            let job = jobs
                .get_mut(&id)
                .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;
            if job.state != JobState::Running || job.lock_owner.as_deref() != Some(worker_id) {
                return Err(AppError::Conflict(format!(
                    "job {id} is not locked by {worker_id}"
                )));
            }
            job.check_transition(next)?;
            Ok(f(job))
        }
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn enqueue(&self, new: NewJob) -> Result<JobId> {
            let now = self.time_provider.now_millis();
            let mut jobs = self.lock();
            let id = jobs.keys().next_back().copied().unwrap_or(0) + 1;
            jobs.insert(
                id,
                Job {
                    id,
                    queue: new.queue,
                    job_type: new.job_type,
                    priority: new.priority,
                    payload: new.payload,
                    state: JobState::Pending,
                    scheduled_at: new.scheduled_at,
                    lock_owner: None,
                    lock_time: None,
                    attempts: 0,
                    max_attempts: new.max_attempts,
                    last_error: None,
                    created_at: now,
                    finished_at: None,
                },
            );
            Ok(id)
        }

        async fn claim_next(&self, queue: Queue, worker_id: &str) -> Result<Option<Job>> {
            if self.fail_claims.lock().map(|f| *f).unwrap_or(false) {
                return Err(AppError::Database("claim failed (injected)".to_string()));
            }
            let now = self.time_provider.now_millis();
            let mut jobs = self.lock();
            let next = jobs
                .values()
                .filter(|j| j.queue == queue && j.scheduled_at <= now)
                .filter(|j| {
                    (j.state == JobState::Pending && j.lock_owner.is_none())
                        || (self.is_stale(j, now) && j.attempts + 1 < j.max_attempts)
                })
                .min_by_key(|j| (j.priority, j.scheduled_at, j.id))
                .map(|j| j.id);

            let Some(job) = next.and_then(|id| jobs.get_mut(&id)) else {
                return Ok(None);
            };
            if job.state == JobState::Running {
                job.attempts += 1;
                let lost_owner = job.lock_owner.as_deref().unwrap_or_default();
                job.last_error = Some(stale_lock_error(lost_owner));
            } else {
                job.check_transition(JobState::Running)?;
            }
            job.state = JobState::Running;
            job.lock_owner = Some(worker_id.to_string());
            job.lock_time = Some(now);
            Ok(Some(job.clone()))
        }

        async fn complete(&self, id: JobId, worker_id: &str) -> Result<()> {
            let now = self.time_provider.now_millis();
            self.with_owned(id, worker_id, JobState::Completed, |job| {
                job.state = JobState::Completed;
                job.lock_owner = None;
                job.lock_time = None;
                job.finished_at = Some(now);
            })
        }

        async fn reschedule(
            &self,
            id: JobId,
            worker_id: &str,
            next_attempt_at: i64,
            error: &str,
        ) -> Result<()> {
            self.with_owned(id, worker_id, JobState::Pending, |job| {
                job.state = JobState::Pending;
                job.lock_owner = None;
                job.lock_time = None;
                job.attempts = (job.attempts + 1).min(job.max_attempts);
                job.scheduled_at = next_attempt_at;
                job.last_error = Some(error.to_string());
            })
        }

        async fn mark_failed(&self, id: JobId, worker_id: &str, error: &str) -> Result<()> {
            let now = self.time_provider.now_millis();
            self.with_owned(id, worker_id, JobState::Failed, |job| {
                job.state = JobState::Failed;
                job.lock_owner = None;
                job.lock_time = None;
                job.attempts = (job.attempts + 1).min(job.max_attempts);
                job.last_error = Some(error.to_string());
                job.finished_at = Some(now);
            })
        }

        async fn release_without_penalty(&self, id: JobId, worker_id: &str) -> Result<()> {
            self.with_owned(id, worker_id, JobState::Pending, |job| {
                job.state = JobState::Pending;
                job.lock_owner = None;
                job.lock_time = None;
            })
        }

        async fn reclaim_stale_locks(&self) -> Result<Vec<StaleClaim>> {
            let now = self.time_provider.now_millis();
            let mut jobs = self.lock();
            let mut reclaimed = Vec::new();
            for job in jobs.values_mut() {
                if !self.is_stale(job, now) {
                    continue;
                }
                let exhausted = job.attempts + 1 >= job.max_attempts;
                let next = if exhausted {
                    JobState::Failed
                } else {
                    JobState::Pending
                };
                job.check_transition(next)?;

                let previous_owner = job.lock_owner.take().unwrap_or_default();
                job.last_error = Some(stale_lock_error(&previous_owner));
                job.attempts = (job.attempts + 1).min(job.max_attempts);
                job.state = next;
                if exhausted {
                    job.finished_at = Some(now);
                }
                reclaimed.push(StaleClaim {
                    job_id: job.id,
                    previous_owner,
                    locked_at: job.lock_time.take().unwrap_or_default(),
                    exhausted,
                });
            }
            Ok(reclaimed)
        }

        async fn find_by_id(&self, id: JobId) -> Result<Option<Job>> {
            Ok(self.get(id))
        }

        async fn count_by_state(&self, queue: Queue, state: JobState) -> Result<i64> {
            Ok(self
                .lock()
                .values()
                .filter(|j| j.queue == queue && j.state == state)
                .count() as i64)
        }
    }
}
