// Telemetry Port (event/counter contract for metrics and tracing backends)

use crate::domain::{JobId, JobType, Queue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

/// Counter names
pub mod counters {
    pub const JOBS_RETRIES: &str = "jobs.retries";
    pub const JOBS_COMPLETED: &str = "jobs.completed";
    pub const JOBS_FAILED: &str = "jobs.failed";
    pub const JOBS_EXHAUSTED: &str = "jobs.exhausted";
    pub const JOBS_INTERRUPTED: &str = "jobs.interrupted";
    pub const ADMISSION_DENIED: &str = "admission.denied";
    pub const BUDGET_COST_CENTS: &str = "budget.cost_cents";
    pub const BUDGET_REQUESTS: &str = "budget.requests";
    pub const GATE_ACQUIRED: &str = "gate.acquired";
    pub const GATE_REJECTED: &str = "gate.rejected";
}

/// Gauge names
pub mod gauges {
    pub const GATE_PERMITS_IN_USE: &str = "gate.permits_in_use";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEventKind {
    Completed,
    Failed,
    RetryScheduled { next_attempt_at: i64 },
    Exhausted,
    Interrupted,
}

impl JobEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Completed => "job.completed",
            JobEventKind::Failed => "job.failed",
            JobEventKind::RetryScheduled { .. } => "job.retry_scheduled",
            JobEventKind::Exhausted => "job.exhausted",
            JobEventKind::Interrupted => "job.interrupted",
        }
    }
}

/// Lifecycle event attributes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: JobId,
    pub job_type: JobType,
    pub queue: Queue,
    /// Attempt the event refers to (1-indexed)
    pub attempt: i32,
    pub detail: Option<String>,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Sink for lifecycle events, counters and gauges
///
/// `scope` is the queue name for job and gate metrics and the provider for
/// budget metrics.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &JobEvent);
    fn increment(&self, counter: &'static str, scope: &str, by: u64);
    fn gauge(&self, name: &'static str, scope: &str, value: f64);
}

/// Point-in-time copy of every counter and gauge
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// counter -> scope -> value
    pub counters: BTreeMap<String, BTreeMap<String, u64>>,
    /// gauge -> scope -> last value
    pub gauges: BTreeMap<String, BTreeMap<String, f64>>,
}

impl TelemetrySnapshot {
    /// Counter summed over all scopes
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|scopes| scopes.values().sum())
            .unwrap_or(0)
    }

    pub fn counter_for(&self, name: &str, scope: &str) -> u64 {
        self.counters
            .get(name)
            .and_then(|scopes| scopes.get(scope))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_for(&self, name: &str, scope: &str) -> Option<f64> {
        self.gauges.get(name).and_then(|scopes| scopes.get(scope)).copied()
    }
}

/// Logs under the `conveyor::telemetry` target and keeps an in-process snapshot
#[derive(Default)]
pub struct TracingTelemetry {
    state: Mutex<TelemetrySnapshot>,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut TelemetrySnapshot)) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state);
    }
}

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: &JobEvent) {
        let next_attempt_at = match event.kind {
            JobEventKind::RetryScheduled { next_attempt_at } => Some(next_attempt_at),
            _ => None,
        };
        info!(
            target: "conveyor::telemetry",
            event = event.name(),
            job_id = event.job_id,
            job_type = %event.job_type,
            queue = %event.queue,
            attempt = event.attempt,
            next_attempt_at = ?next_attempt_at,
            detail = ?event.detail,
        );
    }

    fn increment(&self, counter: &'static str, scope: &str, by: u64) {
        self.with_state(|state| {
            *state
                .counters
                .entry(counter.to_string())
                .or_default()
                .entry(scope.to_string())
                .or_insert(0) += by;
        });
    }

    fn gauge(&self, name: &'static str, scope: &str, value: f64) {
        self.with_state(|state| {
            state
                .gauges
                .entry(name.to_string())
                .or_default()
                .insert(scope.to_string(), value);
        });
    }
}

pub mod mocks {
    use super::*;

    /// Records events and delegates counters to an in-memory snapshot
    #[derive(Default)]
    pub struct RecordingTelemetry {
        events: Mutex<Vec<JobEvent>>,
        inner: TracingTelemetry,
    }

    impl RecordingTelemetry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<JobEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }

        pub fn event_names(&self) -> Vec<&'static str> {
            self.events().iter().map(|e| e.name()).collect()
        }

        pub fn count(&self, name: &str) -> usize {
            self.events().iter().filter(|e| e.name() == name).count()
        }

        pub fn snapshot(&self) -> TelemetrySnapshot {
            self.inner.snapshot()
        }
    }

    impl TelemetrySink for RecordingTelemetry {
        fn emit(&self, event: &JobEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event.clone());
            }
        }

        fn increment(&self, counter: &'static str, scope: &str, by: u64) {
            self.inner.increment(counter, scope, by);
        }

        fn gauge(&self, name: &'static str, scope: &str, value: f64) {
            self.inner.gauge(name, scope, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_aggregate_per_scope() {
        let telemetry = TracingTelemetry::new();
        telemetry.increment(counters::JOBS_COMPLETED, "feeds", 1);
        telemetry.increment(counters::JOBS_COMPLETED, "feeds", 2);
        telemetry.increment(counters::JOBS_COMPLETED, "urgent", 1);
        telemetry.gauge(gauges::GATE_PERMITS_IN_USE, "screenshots", 2.0);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.counter(counters::JOBS_COMPLETED), 4);
        assert_eq!(snapshot.counter_for(counters::JOBS_COMPLETED, "feeds"), 3);
        assert_eq!(snapshot.counter(counters::JOBS_RETRIES), 0);
        assert_eq!(
            snapshot.gauge_for(gauges::GATE_PERMITS_IN_USE, "screenshots"),
            Some(2.0)
        );
    }

    #[test]
    fn test_event_names() {
        assert_eq!(JobEventKind::Completed.name(), "job.completed");
        assert_eq!(
            JobEventKind::RetryScheduled { next_attempt_at: 0 }.name(),
            "job.retry_scheduled"
        );
        assert_eq!(JobEventKind::Interrupted.name(), "job.interrupted");
    }
}
