// Enqueue Service - producer entry point

mod validate;
#[cfg(test)]
mod validate_test;

pub use validate::{validate_request, MAX_JOB_TYPE_LEN, MAX_PAYLOAD_DEPTH};

use crate::application::registry::JobRegistry;
use crate::domain::{JobId, JobPayload, JobType, NewJob};
use crate::error::{AppError, Result};
use crate::port::{JobStore, TimeProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Enqueue request
///
/// Queue, priority and retry budget come from the registry entry of
/// `job_type`. Unknown fields (including `queue` and `priority`) are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub payload: serde_json::Value,

    /// Earliest execution time (epoch ms); now when absent
    #[serde(default)]
    pub scheduled_at: Option<i64>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            scheduled_at: None,
        }
    }
}

/// Enqueue use case
pub struct EnqueueService {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    time_provider: Arc<dyn TimeProvider>,
}

impl EnqueueService {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            registry,
            time_provider,
        }
    }

    /// Enqueue a job due now
    pub async fn enqueue(&self, job_type: &str, payload: serde_json::Value) -> Result<JobId> {
        self.submit(EnqueueRequest::new(job_type, payload)).await
    }

    /// Enqueue a job due at `scheduled_at` (epoch ms)
    pub async fn enqueue_at(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        scheduled_at: i64,
    ) -> Result<JobId> {
        let mut req = EnqueueRequest::new(job_type, payload);
        req.scheduled_at = Some(scheduled_at);
        self.submit(req).await
    }

    /// Validate, resolve the job type and insert
    ///
    /// # Arguments
    ///
    /// * `req` - Enqueue request
    pub async fn submit(&self, req: EnqueueRequest) -> Result<JobId> {
        validate_request(&req)?;

        let job_type = JobType::new(req.job_type);
        let definition = self.registry.definition(&job_type).ok_or_else(|| {
            AppError::Validation(format!("unknown job type: {}", job_type))
        })?;

        let now = self.time_provider.now_millis();
        let new_job = NewJob::new(
            definition.queue,
            job_type.clone(),
            JobPayload::new(req.payload),
            req.scheduled_at.unwrap_or(now),
        )
        .with_priority(definition.priority)
        .with_max_attempts(definition.max_attempts);

        let queue = new_job.queue;
        let scheduled_at = new_job.scheduled_at;
        let id = self.store.enqueue(new_job).await?;

        info!(
            job_id = id,
            job_type = %job_type,
            queue = %queue,
            scheduled_at = scheduled_at,
            "Job enqueued"
        );
        Ok(id)
    }
}
