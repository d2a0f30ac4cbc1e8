// Dispatcher - per-queue poll loop

pub mod constants;
mod execution;
mod shutdown;

use constants::*;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::budget::BudgetGovernor;
use crate::application::escalation::EscalationRouter;
use crate::application::gate::{ConcurrencyGate, GatePermit};
use crate::application::registry::{JobRegistry, DEFAULT_BASE_DELAY};
use crate::application::retry::{RetryDecision, RetryPlanner};
use crate::domain::{Job, Outcome, QueueConfig};
use crate::error::{AppError, Result};
use crate::port::telemetry::{counters, gauges};
use crate::port::{JobEvent, JobEventKind, JobStore, TelemetrySink, TimeProvider};
use execution::{run_guarded, Execution};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Per-process dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lock owner written on every claim
    pub worker_id: String,
    pub shutdown_grace: Duration,
    /// Send `PermanentFailure` straight to FAILED instead of the retry path
    pub fail_fast_on_permanent: bool,
}

impl DispatcherConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            fail_fast_on_permanent: false,
        }
    }
}

/// Collaborators shared by every dispatcher of a process
#[derive(Clone)]
pub struct DispatcherDeps {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<JobRegistry>,
    pub planner: RetryPlanner,
    pub escalation: Arc<EscalationRouter>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub time_provider: Arc<dyn TimeProvider>,
}

/// What happened to one claimed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Completed,
    Retried,
    Exhausted,
    Denied,
    Interrupted,
    LostLock,
}

/// Tally of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub exhausted: usize,
    pub denied: usize,
    pub interrupted: usize,
    pub lost_locks: usize,
    /// The budget governor allowed no batch at all
    pub deferred: bool,
}

impl CycleReport {
    fn record(&mut self, result: JobResult) {
        match result {
            JobResult::Completed => self.completed += 1,
            JobResult::Retried => self.retried += 1,
            JobResult::Exhausted => self.exhausted += 1,
            JobResult::Denied => self.denied += 1,
            JobResult::Interrupted => self.interrupted += 1,
            JobResult::LostLock => self.lost_locks += 1,
        }
    }

    fn merge(&mut self, other: &CycleReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.retried += other.retried;
        self.exhausted += other.exhausted;
        self.denied += other.denied;
        self.interrupted += other.interrupted;
        self.lost_locks += other.lost_locks;
        self.deferred |= other.deferred;
    }
}

enum Admission {
    Granted(Option<GatePermit>),
    Denied(&'static str),
}

/// Drains one queue family
///
/// Polls on a fixed cadence, claims up to a batch of jobs (running at most
/// `workers` at once), applies budget and gate admission, executes the
/// handler and records the outcome. Infrastructure errors abort the current
/// cycle only; the next tick starts fresh.
pub struct Dispatcher {
    queue: QueueConfig,
    config: DispatcherConfig,
    deps: DispatcherDeps,
    gate: Option<ConcurrencyGate>,
    governor: Option<Arc<BudgetGovernor>>,
}

impl Dispatcher {
    /// Create a dispatcher; gated queues get a gate sized from `queue.gate_capacity`
    pub fn new(queue: QueueConfig, config: DispatcherConfig, deps: DispatcherDeps) -> Self {
        let gate = queue
            .gate_capacity
            .map(|capacity| ConcurrencyGate::new(queue.queue, capacity));
        Self {
            queue,
            config,
            deps,
            gate,
            governor: None,
        }
    }

    /// Share an existing gate (e.g. one also read by the stats endpoint)
    pub fn with_gate(mut self, gate: ConcurrencyGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_governor(mut self, governor: Arc<BudgetGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    pub fn gate(&self) -> Option<&ConcurrencyGate> {
        self.gate.as_ref()
    }

    /// Run the poll loop until shutdown
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        if self.queue.budget_gated && self.governor.is_none() {
            return Err(AppError::Config(format!(
                "queue {} is budget-gated but no budget governor is configured",
                self.queue.queue
            )));
        }

        info!(
            queue = %self.queue.queue,
            worker_id = %self.config.worker_id,
            workers = self.queue.workers,
            poll_interval_secs = self.queue.poll_interval.as_secs(),
            "Dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.queue.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            if shutdown.is_shutdown() {
                break;
            }

            match self.poll_cycle(&shutdown).await {
                Ok(report) if report.claimed > 0 => {
                    info!(queue = %self.queue.queue, report = ?report, "Poll cycle finished");
                }
                Ok(report) => {
                    debug!(queue = %self.queue.queue, deferred = report.deferred, "Poll cycle idle");
                }
                Err(e) => {
                    error!(queue = %self.queue.queue, error = %e, "Poll cycle aborted");
                }
            }
        }

        info!(queue = %self.queue.queue, "Dispatcher stopped");
        Ok(())
    }

    /// One tick: keep claiming batches until the queue is drained or gated
    ///
    /// For budget-gated queues the batch size is recomputed from the
    /// governor before every batch.
    pub async fn poll_cycle(&self, shutdown: &ShutdownToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        while !shutdown.is_shutdown() {
            let batch_size = match self.budget_governor() {
                Some(governor) => {
                    let state = governor.current_state().await?;
                    let size = governor.batch_size_for(state);
                    if size == 0 {
                        info!(
                            queue = %self.queue.queue,
                            provider = %governor.provider(),
                            state = %state,
                            "Budget throttle: batch deferred"
                        );
                        report.deferred = true;
                        break;
                    }
                    size
                }
                None => self.queue.batch_size,
            };

            let (batch, drained) = self.run_batch(batch_size, shutdown).await?;
            report.merge(&batch);

            // A denial means the gate or budget is saturated; re-claiming would spin
            if drained || batch.denied > 0 || batch.claimed < batch_size {
                break;
            }
        }

        Ok(report)
    }

    /// Claim and process up to `batch_size` jobs, `workers` at a time
    async fn run_batch(
        &self,
        batch_size: usize,
        shutdown: &ShutdownToken,
    ) -> Result<(CycleReport, bool)> {
        let report = Mutex::new(CycleReport::default());
        let first_error: Mutex<Option<AppError>> = Mutex::new(None);
        let stop = AtomicBool::new(false);
        let drained = AtomicBool::new(false);

        let this = self;
        let (report_ref, error_ref, stop_ref, drained_ref) = (&report, &first_error, &stop, &drained);
        stream::iter(0..batch_size)
            .for_each_concurrent(self.queue.workers.max(1), move |_| async move {
                if stop_ref.load(Ordering::SeqCst) || shutdown.is_shutdown() {
                    return;
                }

                let job = match this
                    .deps
                    .store
                    .claim_next(this.queue.queue, &this.config.worker_id)
                    .await
                {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        drained_ref.store(true, Ordering::SeqCst);
                        stop_ref.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        stop_ref.store(true, Ordering::SeqCst);
                        keep_first(error_ref, e);
                        return;
                    }
                };

                if let Ok(mut r) = report_ref.lock() {
                    r.claimed += 1;
                }

                match this.process_job(job, shutdown).await {
                    Ok(result) => {
                        if result == JobResult::Denied {
                            stop_ref.store(true, Ordering::SeqCst);
                        }
                        if let Ok(mut r) = report_ref.lock() {
                            r.record(result);
                        }
                    }
                    Err(e) => {
                        stop_ref.store(true, Ordering::SeqCst);
                        keep_first(error_ref, e);
                    }
                }
            })
            .await;

        let first_error = first_error
            .into_inner()
            .map_err(|_| AppError::Internal("batch error slot poisoned".to_string()))?;
        if let Some(e) = first_error {
            return Err(e);
        }
        let report = report
            .into_inner()
            .map_err(|_| AppError::Internal("batch report poisoned".to_string()))?;
        Ok((report, drained.load(Ordering::SeqCst)))
    }

    /// Admission, execution and outcome bookkeeping for one claimed job
    async fn process_job(&self, job: Job, shutdown: &ShutdownToken) -> Result<JobResult> {
        let permit = match self.admit().await {
            Ok(Admission::Granted(permit)) => permit,
            Ok(Admission::Denied(reason)) => return self.deny(&job, reason).await,
            Err(e) => {
                // Hand the job back before surfacing the infrastructure error
                if let Err(release_err) = self
                    .deps
                    .store
                    .release_without_penalty(job.id, &self.config.worker_id)
                    .await
                {
                    warn!(job_id = job.id, error = %release_err, "Failed to release job after admission error");
                }
                return Err(e);
            }
        };

        let registered = self.deps.registry.get(&job.job_type).cloned();
        let (execution, base_delay) = match registered {
            Some(entry) => {
                info!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    queue = %job.queue,
                    attempt = job.current_attempt(),
                    worker_id = %self.config.worker_id,
                    "Processing job"
                );
                let execution = run_guarded(
                    entry.handler,
                    job.id,
                    job.payload.clone(),
                    entry.definition.timeout,
                    permit,
                    shutdown.clone(),
                    self.config.shutdown_grace,
                )
                .await;
                (execution, entry.definition.base_delay)
            }
            None => {
                drop(permit);
                error!(job_id = job.id, job_type = %job.job_type, "No handler for job type");
                (
                    Execution::Finished(Outcome::retryable(format!(
                        "{MISSING_HANDLER_ERROR}: {}",
                        job.job_type
                    ))),
                    DEFAULT_BASE_DELAY,
                )
            }
        };
        self.report_gate_usage();

        match execution {
            Execution::Finished(outcome) => self.apply_outcome(&job, outcome, base_delay).await,
            Execution::Interrupted => self.interrupt(&job).await,
        }
    }

    async fn admit(&self) -> Result<Admission> {
        if let Some(governor) = self.budget_governor() {
            let state = governor.current_state().await?;
            if !state.allows_execution() {
                return Ok(Admission::Denied(BUDGET_DENIAL_REASON));
            }
        }

        let Some(gate) = &self.gate else {
            return Ok(Admission::Granted(None));
        };
        let scope = self.queue.queue.as_str();
        match gate.try_acquire() {
            Some(permit) => {
                self.deps.telemetry.increment(counters::GATE_ACQUIRED, scope, 1);
                self.report_gate_usage();
                Ok(Admission::Granted(Some(permit)))
            }
            None => {
                self.deps.telemetry.increment(counters::GATE_REJECTED, scope, 1);
                Ok(Admission::Denied(GATE_DENIAL_REASON))
            }
        }
    }

    /// Admission denial: not a failure, no attempt consumed, no escalation
    async fn deny(&self, job: &Job, reason: &'static str) -> Result<JobResult> {
        let released = self
            .deps
            .store
            .release_without_penalty(job.id, &self.config.worker_id)
            .await;
        if !self.lock_held(job, "release", released)? {
            return Ok(JobResult::LostLock);
        }
        self.deps
            .telemetry
            .increment(counters::ADMISSION_DENIED, job.queue.as_str(), 1);
        info!(
            job_id = job.id,
            job_type = %job.job_type,
            queue = %job.queue,
            reason = reason,
            "Admission denied, job released without penalty"
        );
        Ok(JobResult::Denied)
    }

    /// Shutdown cut the handler short: hand the job back untouched
    async fn interrupt(&self, job: &Job) -> Result<JobResult> {
        let released = self
            .deps
            .store
            .release_without_penalty(job.id, &self.config.worker_id)
            .await;
        if !self.lock_held(job, "release", released)? {
            return Ok(JobResult::LostLock);
        }
        self.emit(job, JobEventKind::Interrupted, job.current_attempt(), None);
        self.deps
            .telemetry
            .increment(counters::JOBS_INTERRUPTED, job.queue.as_str(), 1);
        Ok(JobResult::Interrupted)
    }

    async fn apply_outcome(
        &self,
        job: &Job,
        outcome: Outcome,
        base_delay: Duration,
    ) -> Result<JobResult> {
        let attempt = job.current_attempt();
        let worker_id = self.config.worker_id.as_str();
        let scope = job.queue.as_str();

        let (reason, permanent) = match outcome {
            Outcome::Success => {
                let done = self.deps.store.complete(job.id, worker_id).await;
                if !self.lock_held(job, "complete", done)? {
                    return Ok(JobResult::LostLock);
                }
                self.emit(job, JobEventKind::Completed, attempt, None);
                self.deps.telemetry.increment(counters::JOBS_COMPLETED, scope, 1);
                info!(job_id = job.id, attempt = attempt, "Job completed");
                return Ok(JobResult::Completed);
            }
            Outcome::RetryableFailure(reason) => (reason, false),
            Outcome::PermanentFailure(reason) => (reason, true),
        };

        self.emit(job, JobEventKind::Failed, attempt, Some(reason.clone()));
        self.deps.telemetry.increment(counters::JOBS_FAILED, scope, 1);

        let decision = if permanent && self.config.fail_fast_on_permanent {
            RetryDecision::Exhausted
        } else {
            self.deps.planner.plan(attempt, job.max_attempts, base_delay)
        };

        match decision {
            RetryDecision::Retry { delay } => {
                let next_attempt_at = self.deps.time_provider.now_millis()
                    + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
                let rescheduled = self
                    .deps
                    .store
                    .reschedule(job.id, worker_id, next_attempt_at, &reason)
                    .await;
                if !self.lock_held(job, "reschedule", rescheduled)? {
                    return Ok(JobResult::LostLock);
                }
                self.emit(
                    job,
                    JobEventKind::RetryScheduled { next_attempt_at },
                    attempt,
                    Some(reason.clone()),
                );
                self.deps.telemetry.increment(counters::JOBS_RETRIES, scope, 1);
                warn!(
                    job_id = job.id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Retrying job after failure"
                );
                Ok(JobResult::Retried)
            }
            RetryDecision::Exhausted => {
                let failed = self.deps.store.mark_failed(job.id, worker_id, &reason).await;
                if !self.lock_held(job, "mark_failed", failed)? {
                    return Ok(JobResult::LostLock);
                }
                self.emit(job, JobEventKind::Exhausted, attempt, Some(reason.clone()));
                self.deps.telemetry.increment(counters::JOBS_EXHAUSTED, scope, 1);
                error!(
                    job_id = job.id,
                    attempt = attempt,
                    permanent = permanent,
                    error = %reason,
                    "Job failed after max retries"
                );

                // Only the worker that moved the job to FAILED escalates it
                if let Err(e) = self.deps.escalation.escalate(job, &reason).await {
                    error!(job_id = job.id, error = %e, "Escalation failed");
                }
                Ok(JobResult::Exhausted)
            }
        }
    }

    /// Infrastructure errors propagate and abort the cycle; any other refusal
    /// of a guarded mutation means the job is no longer ours
    fn lock_held(&self, job: &Job, op: &'static str, result: Result<()>) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_infrastructure() => Err(e),
            Err(e) => {
                warn!(
                    job_id = job.id,
                    op = op,
                    worker_id = %self.config.worker_id,
                    reason = %e,
                    "Lock lost, another worker owns the job"
                );
                Ok(false)
            }
        }
    }

    fn emit(&self, job: &Job, kind: JobEventKind, attempt: i32, detail: Option<String>) {
        self.deps.telemetry.emit(&JobEvent {
            kind,
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue: job.queue,
            attempt,
            detail,
        });
    }

    fn report_gate_usage(&self) {
        if let Some(gate) = &self.gate {
            self.deps.telemetry.gauge(
                gauges::GATE_PERMITS_IN_USE,
                self.queue.queue.as_str(),
                gate.in_use() as f64,
            );
        }
    }

    fn budget_governor(&self) -> Option<&BudgetGovernor> {
        if self.queue.budget_gated {
            self.governor.as_deref()
        } else {
            None
        }
    }
}

fn keep_first(slot: &Mutex<Option<AppError>>, error: AppError) {
    if let Ok(mut slot) = slot.lock() {
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}
