// SQLite JobStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use conveyor_core::application::dispatcher::constants::DEFAULT_STALE_LOCK_TIMEOUT;
use conveyor_core::domain::{Job, JobId, JobPayload, JobState, JobType, NewJob, Queue};
use conveyor_core::error::{AppError, Result};
use conveyor_core::port::job_store::{stale_lock_error, STALE_LOCK_ERROR};
use conveyor_core::port::{JobStore, StaleClaim, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Claim the most urgent due row: unlocked PENDING, or RUNNING with a stale lock
/// and an attempt left. A takeover charges the abandoned execution one attempt.
/// SQLite runs the whole statement under its single writer lock, so two
/// claimers can never take the same row. SET expressions see the old row.
const CLAIM_SQL: &str = r#"
UPDATE jobs
SET state = 'RUNNING', lock_owner = ?1, lock_time = ?2,
    attempts = CASE WHEN state = 'RUNNING' THEN attempts + 1 ELSE attempts END,
    last_error = CASE WHEN state = 'RUNNING' THEN ?5 || COALESCE(lock_owner, '') ELSE last_error END
WHERE id = (
    SELECT id FROM jobs
    WHERE queue = ?3
      AND scheduled_at <= ?2
      AND ((state = 'PENDING' AND lock_owner IS NULL)
           OR (state = 'RUNNING' AND lock_time < ?4 AND attempts + 1 < max_attempts))
    ORDER BY priority ASC, scheduled_at ASC, id ASC
    LIMIT 1
)
RETURNING *
"#;

/// Settle one stale lock seen by the reaper; the guard on the exact lock lets a
/// fresh claim in between win
const RECLAIM_SQL: &str = r#"
UPDATE jobs
SET state = CASE WHEN attempts + 1 >= max_attempts THEN 'FAILED' ELSE 'PENDING' END,
    finished_at = CASE WHEN attempts + 1 >= max_attempts THEN ?1 ELSE finished_at END,
    attempts = MIN(attempts + 1, max_attempts),
    last_error = ?2,
    lock_owner = NULL, lock_time = NULL
WHERE id = ?3 AND state = 'RUNNING' AND lock_owner = ?4 AND lock_time = ?5
RETURNING state
"#;

pub struct SqliteJobStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
    stale_lock_timeout: Duration,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
            stale_lock_timeout: DEFAULT_STALE_LOCK_TIMEOUT,
        }
    }

    /// Locks older than `timeout` are abandoned and claimable again
    pub fn with_stale_lock_timeout(mut self, timeout: Duration) -> Self {
        self.stale_lock_timeout = timeout;
        self
    }

    fn stale_cutoff(&self, now: i64) -> i64 {
        now - i64::try_from(self.stale_lock_timeout.as_millis()).unwrap_or(i64::MAX / 2)
    }

    /// Explain why a guarded mutation touched no row
    async fn guard_failure(&self, id: JobId, worker_id: &str, op: &str) -> AppError {
        let current: std::result::Result<Option<(String, Option<String>)>, sqlx::Error> =
            sqlx::query_as("SELECT state, lock_owner FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(None) => AppError::NotFound(format!("Job {} not found", id)),
            Ok(Some((state, owner))) => AppError::Conflict(format!(
                "Cannot {} job {}: state {}, locked by {:?}, not {}",
                op, id, state, owner, worker_id
            )),
            Err(e) => map_sqlx_error(e),
        }
    }

    async fn guarded(
        &self,
        id: JobId,
        worker_id: &str,
        op: &str,
        result: std::result::Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
    ) -> Result<()> {
        let result = result.map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(self.guard_failure(id, worker_id, op).await);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let now = self.time_provider.now_millis();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                queue, job_type, priority, payload, state,
                scheduled_at, attempts, max_attempts, created_at
            ) VALUES (?, ?, ?, ?, 'PENDING', ?, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(job.queue.as_str())
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(job.payload.as_value().to_string())
        .bind(job.scheduled_at)
        .bind(job.max_attempts)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(id)
    }

    async fn claim_next(&self, queue: Queue, worker_id: &str) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();

        let row = sqlx::query_as::<_, JobRow>(CLAIM_SQL)
            .bind(worker_id)
            .bind(now)
            .bind(queue.as_str())
            .bind(self.stale_cutoff(now))
            .bind(STALE_LOCK_ERROR)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let job = row.into_job()?;
                debug!(job_id = job.id, queue = %queue, worker_id = worker_id, "Claimed job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, id: JobId, worker_id: &str) -> Result<()> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'COMPLETED', lock_owner = NULL, lock_time = NULL, finished_at = ?
            WHERE id = ? AND lock_owner = ? AND state = 'RUNNING'
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await;

        self.guarded(id, worker_id, "complete", result).await
    }

    async fn reschedule(
        &self,
        id: JobId,
        worker_id: &str,
        next_attempt_at: i64,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'PENDING', lock_owner = NULL, lock_time = NULL,
                attempts = MIN(attempts + 1, max_attempts),
                scheduled_at = ?, last_error = ?
            WHERE id = ? AND lock_owner = ? AND state = 'RUNNING'
            "#,
        )
        .bind(next_attempt_at)
        .bind(error)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await;

        self.guarded(id, worker_id, "reschedule", result).await
    }

    async fn mark_failed(&self, id: JobId, worker_id: &str, error: &str) -> Result<()> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'FAILED', lock_owner = NULL, lock_time = NULL,
                attempts = MIN(attempts + 1, max_attempts),
                last_error = ?, finished_at = ?
            WHERE id = ? AND lock_owner = ? AND state = 'RUNNING'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await;

        self.guarded(id, worker_id, "fail", result).await
    }

    async fn release_without_penalty(&self, id: JobId, worker_id: &str) -> Result<()> {
        // scheduled_at was never touched by the claim, so it still holds the original due time
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'PENDING', lock_owner = NULL, lock_time = NULL
            WHERE id = ? AND lock_owner = ? AND state = 'RUNNING'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await;

        self.guarded(id, worker_id, "release", result).await
    }

    async fn reclaim_stale_locks(&self) -> Result<Vec<StaleClaim>> {
        let now = self.time_provider.now_millis();

        let candidates: Vec<(i64, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, lock_owner, lock_time FROM jobs
            WHERE state = 'RUNNING' AND lock_time < ?
            ORDER BY lock_time ASC
            "#,
        )
        .bind(self.stale_cutoff(now))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut reclaimed = Vec::with_capacity(candidates.len());
        for (id, owner, locked_at) in candidates {
            let settled: Option<String> = sqlx::query_scalar(RECLAIM_SQL)
                .bind(now)
                .bind(stale_lock_error(&owner))
                .bind(id)
                .bind(&owner)
                .bind(locked_at)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

            if let Some(state) = settled {
                reclaimed.push(StaleClaim {
                    job_id: id,
                    previous_owner: owner,
                    locked_at,
                    exhausted: state == JobState::Failed.as_str(),
                });
            }
        }

        Ok(reclaimed)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn count_by_state(&self, queue: Queue, state: JobState) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state = ?")
                .bind(queue.as_str())
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(count)
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    queue: String,
    job_type: String,
    priority: i32,
    payload: String,
    state: String,
    scheduled_at: i64,
    lock_owner: Option<String>,
    lock_time: Option<i64>,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    created_at: i64,
    finished_at: Option<i64>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let corrupt = |what: String| AppError::Database(format!("Corrupt job row {}: {}", self.id, what));

        let queue: Queue = self.queue.parse().map_err(|e| corrupt(format!("{e}")))?;
        let state: JobState = self.state.parse().map_err(|e| corrupt(format!("{e}")))?;
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(format!("payload: {e}")))?;

        Ok(Job {
            id: self.id,
            queue,
            job_type: JobType::new(self.job_type),
            priority: self.priority,
            payload: JobPayload::new(payload),
            state,
            scheduled_at: self.scheduled_at,
            lock_owner: self.lock_owner,
            lock_time: self.lock_time,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_error: self.last_error,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}
