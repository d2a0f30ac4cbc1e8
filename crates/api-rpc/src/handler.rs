//! RPC Method Handlers
//!
//! Implements the business logic for each JSON-RPC method.

use crate::error::to_rpc_error;
use crate::types::{
    BudgetStatusRequest, EnqueueResponse, GetJobRequest, JobResponse, QueueStats,
    QueueStatsRequest, QueueStatsResponse, RecordUsageRequest, SetCeilingRequest,
};
use conveyor_core::application::{BudgetGovernor, BudgetStatus, EnqueueRequest, EnqueueService};
use conveyor_core::domain::{JobState, PeriodKey, Queue};
use conveyor_core::error::AppError;
use conveyor_core::port::telemetry::{counters, gauges, TracingTelemetry};
use conveyor_core::port::JobStore;
use jsonrpsee::types::ErrorObjectOwned;
use std::sync::Arc;

type RpcResult<T> = Result<T, ErrorObjectOwned>;

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    enqueue: Arc<EnqueueService>,
    store: Arc<dyn JobStore>,
    governor: Option<Arc<BudgetGovernor>>,
    telemetry: Arc<TracingTelemetry>,
    queues: Vec<Queue>,
}

impl RpcHandler {
    /// # Arguments
    /// * `queues` - Queues served by this daemon (reported by `queues.stats.v1`)
    pub fn new(
        enqueue: Arc<EnqueueService>,
        store: Arc<dyn JobStore>,
        governor: Option<Arc<BudgetGovernor>>,
        telemetry: Arc<TracingTelemetry>,
        queues: Vec<Queue>,
    ) -> Self {
        Self {
            enqueue,
            store,
            governor,
            telemetry,
            queues,
        }
    }

    /// jobs.enqueue.v1
    pub async fn enqueue(&self, params: EnqueueRequest) -> RpcResult<EnqueueResponse> {
        let job_type = params.job_type.clone();
        let job_id = self.enqueue.submit(params).await.map_err(to_rpc_error)?;

        let job = self
            .store
            .find_by_id(job_id)
            .await
            .map_err(to_rpc_error)?
            .ok_or_else(|| {
                to_rpc_error(AppError::Internal(format!(
                    "Job {} vanished after enqueue",
                    job_id
                )))
            })?;

        Ok(EnqueueResponse {
            job_id,
            job_type,
            queue: job.queue.to_string(),
            state: job.state.to_string(),
            scheduled_at: job.scheduled_at,
        })
    }

    /// jobs.get.v1
    pub async fn get_job(&self, params: GetJobRequest) -> RpcResult<JobResponse> {
        let job = self
            .store
            .find_by_id(params.job_id)
            .await
            .map_err(to_rpc_error)?
            .ok_or_else(|| {
                to_rpc_error(AppError::NotFound(format!("Job {} not found", params.job_id)))
            })?;

        Ok(job.into())
    }

    /// budget.status.v1
    pub async fn budget_status(&self, params: BudgetStatusRequest) -> RpcResult<BudgetStatus> {
        let governor = self.governor_for(params.provider.as_deref())?;
        governor.status().await.map_err(to_rpc_error)
    }

    /// budget.set_ceiling.v1
    pub async fn set_ceiling(&self, params: SetCeilingRequest) -> RpcResult<BudgetStatus> {
        let governor = self.governor_for(params.provider.as_deref())?;
        let period = params
            .period
            .as_deref()
            .map(str::parse::<PeriodKey>)
            .transpose()
            .map_err(|e| to_rpc_error(e.into()))?;

        governor
            .set_ceiling(period, params.ceiling_cents)
            .await
            .map_err(to_rpc_error)
    }

    /// budget.record_usage.v1
    ///
    /// Handlers that call a metered provider report each call here; the
    /// returned state is what the next poll cycle of a gated queue sees.
    pub async fn record_usage(&self, params: RecordUsageRequest) -> RpcResult<BudgetStatus> {
        let governor = self.governor_for(params.provider.as_deref())?;
        let period = governor
            .record_usage(params.input_units, params.output_units, params.cost_cents)
            .await
            .map_err(to_rpc_error)?;
        Ok(governor.to_status(period))
    }

    /// queues.stats.v1
    pub async fn queue_stats(&self, params: QueueStatsRequest) -> RpcResult<QueueStatsResponse> {
        let queues = match params.queue.as_deref() {
            Some(name) => {
                let queue: Queue = name.parse().map_err(|e: conveyor_core::domain::DomainError| {
                    to_rpc_error(e.into())
                })?;
                vec![queue]
            }
            None => self.queues.clone(),
        };

        let snapshot = self.telemetry.snapshot();
        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            let scope = queue.as_str();
            stats.push(QueueStats {
                queue: scope.to_string(),
                pending: self.count(queue, JobState::Pending).await?,
                running: self.count(queue, JobState::Running).await?,
                completed: self.count(queue, JobState::Completed).await?,
                failed: self.count(queue, JobState::Failed).await?,
                retries: snapshot.counter_for(counters::JOBS_RETRIES, scope),
                exhausted: snapshot.counter_for(counters::JOBS_EXHAUSTED, scope),
                admission_denied: snapshot.counter_for(counters::ADMISSION_DENIED, scope),
                gate_permits_in_use: snapshot.gauge_for(gauges::GATE_PERMITS_IN_USE, scope),
            });
        }

        Ok(QueueStatsResponse { queues: stats })
    }

    async fn count(&self, queue: Queue, state: JobState) -> RpcResult<i64> {
        self.store
            .count_by_state(queue, state)
            .await
            .map_err(to_rpc_error)
    }

    fn governor_for(&self, provider: Option<&str>) -> RpcResult<&BudgetGovernor> {
        let governor = self.governor.as_deref().ok_or_else(|| {
            to_rpc_error(AppError::NotFound("No metered provider configured".to_string()))
        })?;

        match provider {
            Some(p) if p != governor.provider() => Err(to_rpc_error(AppError::NotFound(format!(
                "Unknown provider: {}",
                p
            )))),
            _ => Ok(governor),
        }
    }
}
