//! RPC Request/Response Types
//!
//! Defines the JSON-RPC method parameters and results.

use conveyor_core::domain::Job;
use serde::{Deserialize, Serialize};

/// jobs.enqueue.v1 - parameters are `conveyor_core::application::EnqueueRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: i64,
    pub job_type: String,
    pub queue: String,
    pub state: String,
    pub scheduled_at: i64,
}

/// jobs.get.v1 - Look up a job
#[derive(Debug, Serialize, Deserialize)]
pub struct GetJobRequest {
    pub job_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: i64,
    pub queue: String,
    pub job_type: String,
    pub priority: i32,
    pub state: String,
    pub scheduled_at: i64,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub lock_owner: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub payload: serde_json::Value,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.to_string(),
            job_type: job.job_type.to_string(),
            priority: job.priority,
            state: job.state.to_string(),
            scheduled_at: job.scheduled_at,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            lock_owner: job.lock_owner,
            created_at: job.created_at,
            finished_at: job.finished_at,
            payload: job.payload.into_value(),
        }
    }
}

/// budget.status.v1 - Current period of a metered provider
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BudgetStatusRequest {
    /// Defaults to the configured provider
    #[serde(default)]
    pub provider: Option<String>,
}

/// budget.set_ceiling.v1 - Override a period ceiling
#[derive(Debug, Serialize, Deserialize)]
pub struct SetCeilingRequest {
    #[serde(default)]
    pub provider: Option<String>,
    /// "YYYY-MM"; the current period when absent
    #[serde(default)]
    pub period: Option<String>,
    pub ceiling_cents: i64,
}

/// budget.record_usage.v1 - Report one metered call
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordUsageRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub input_units: i64,
    #[serde(default)]
    pub output_units: i64,
    pub cost_cents: i64,
}

/// queues.stats.v1 - Per-queue counts and counters
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueStatsRequest {
    /// Single queue; all served queues when absent
    #[serde(default)]
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub retries: u64,
    pub exhausted: u64,
    pub admission_denied: u64,
    pub gate_permits_in_use: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub queues: Vec<QueueStats>,
}
