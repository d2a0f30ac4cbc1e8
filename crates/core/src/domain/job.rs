// Job Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::queue::Queue;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Job ID (monotonic, assigned by the store)
pub type JobId = i64;

/// Priority (lower number = more urgent)
pub type Priority = i32;

/// Default retry budget for a job type
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Job State
///
/// PENDING -> RUNNING -> COMPLETED
/// RUNNING -> PENDING (rescheduled, released or reclaimed)
/// RUNNING -> FAILED (exhausted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Pending)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            other => Err(DomainError::UnknownState(other.to_string())),
        }
    }
}

/// Job Type (maps 1:1 to a registered handler)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobType(String);

impl JobType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job Payload (opaque JSON object handed to the handler)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload(serde_json::Value);

impl JobPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// Job Entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: Queue,
    pub job_type: JobType,
    pub priority: Priority,
    pub payload: JobPayload,
    pub state: JobState,

    /// Earliest eligible execution time (epoch ms)
    pub scheduled_at: i64,

    // Claim fields: both set or both null
    pub lock_owner: Option<String>,
    pub lock_time: Option<i64>,

    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,

    pub created_at: i64, // epoch ms
    pub finished_at: Option<i64>,
}

impl Job {
    /// Whether a worker currently holds the claim
    pub fn is_claimed(&self) -> bool {
        self.lock_owner.is_some()
    }

    /// Attempt number of the execution currently in flight (1-indexed)
    pub fn current_attempt(&self) -> i32 {
        self.attempts + 1
    }

    /// Validate a state transition against the lifecycle
    pub fn check_transition(&self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        Ok(())
    }
}

/// Insert request for the job store
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: Queue,
    pub job_type: JobType,
    pub priority: Priority,
    pub payload: JobPayload,
    pub scheduled_at: i64,
    pub max_attempts: i32,
}

impl NewJob {
    /// Create an insert request due at `scheduled_at`
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue family the job belongs to
    /// * `job_type` - Job type (resolved to a handler at execution time)
    /// * `payload` - Opaque payload
    /// * `scheduled_at` - Earliest execution time in epoch ms (injected, not system time)
    pub fn new(queue: Queue, job_type: JobType, payload: JobPayload, scheduled_at: i64) -> Self {
        Self {
            queue,
            job_type,
            priority: 0,
            payload,
            scheduled_at,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("QUEUED".parse::<JobState>().is_err());
    }

    #[test]
    fn test_transitions_only_move_forward() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Pending));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(!JobState::Completed.can_transition_to(JobState::Pending));
        assert!(!JobState::Failed.can_transition_to(JobState::Running));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
    }

    #[test]
    fn test_new_job_defaults() {
        let job = NewJob::new(
            Queue::Default,
            JobType::new("feeds.fetch"),
            JobPayload::empty(),
            1_000,
        );
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.priority, 0);

        let job = job.with_priority(-5).with_max_attempts(2);
        assert_eq!(job.priority, -5);
        assert_eq!(job.max_attempts, 2);
    }
}
