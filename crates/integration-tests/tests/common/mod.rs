//! Shared fixtures: real SQLite stores, manual clock, recording sinks

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use conveyor_core::application::{
    shutdown_channel, Dispatcher, DispatcherConfig, DispatcherDeps, EnqueueService,
    EscalationRouter, JobDefinition, JobRegistry, RetryPlanner, ShutdownToken,
};
use conveyor_core::domain::{Job, JobId, JobPayload, JobState, JobType, NewJob, Queue, QueueConfig};
use conveyor_core::port::notifier::mocks::RecordingNotifier;
use conveyor_core::port::telemetry::mocks::RecordingTelemetry;
use conveyor_core::port::time_provider::mocks::ManualClock;
use conveyor_core::port::{JobHandler, JobStore, TimeProvider};
use conveyor_infra_sqlite::{create_pool, run_migrations, SqliteBudgetStore, SqliteJobStore};
use sqlx::SqlitePool;

/// 2026-01-15T00:00:00Z
pub const NOW: i64 = 1_768_435_200_000;
pub const HOUR_MS: i64 = 60 * 60 * 1000;
pub const JOB_TYPE: &str = "test.job";

pub async fn memory_pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// File-backed database for multi-connection tests; removed on drop
pub struct TempDb {
    pub path: PathBuf,
    pub pool: SqlitePool,
}

impl TempDb {
    pub async fn new() -> Self {
        let path = std::env::temp_dir().join(format!("conveyor-{}.db", uuid::Uuid::new_v4()));
        let pool = create_pool(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        Self { path, pool }
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", self.path.display(), suffix));
        }
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub clock: Arc<ManualClock>,
    pub store: Arc<SqliteJobStore>,
    pub budget_store: Arc<SqliteBudgetStore>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_pool(memory_pool().await)
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        let clock = Arc::new(ManualClock::new(NOW));
        Self {
            store: Arc::new(SqliteJobStore::new(pool.clone(), clock.clone())),
            budget_store: Arc::new(SqliteBudgetStore::new(pool.clone(), clock.clone())),
            pool,
            clock,
            telemetry: Arc::new(RecordingTelemetry::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }

    pub fn registry(
        &self,
        definition: JobDefinition,
        handler: Arc<dyn JobHandler>,
    ) -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register(definition, handler).unwrap();
        Arc::new(registry)
    }

    pub fn deps(&self, registry: Arc<JobRegistry>) -> DispatcherDeps {
        DispatcherDeps {
            store: self.store.clone(),
            registry,
            planner: RetryPlanner::new(),
            escalation: Arc::new(EscalationRouter::new(self.notifier.clone())),
            telemetry: self.telemetry.clone(),
            time_provider: self.clock.clone(),
        }
    }

    pub fn dispatcher(&self, queue: Queue, handler: Arc<dyn JobHandler>) -> Dispatcher {
        self.dispatcher_with(queue, handler, DispatcherConfig::new("worker-a"))
    }

    pub fn dispatcher_with(
        &self,
        queue: Queue,
        handler: Arc<dyn JobHandler>,
        config: DispatcherConfig,
    ) -> Dispatcher {
        let registry = self.registry(JobDefinition::new(JOB_TYPE, queue), handler);
        Dispatcher::new(QueueConfig::defaults_for(queue), config, self.deps(registry))
    }

    pub fn enqueue_service(&self, registry: Arc<JobRegistry>) -> EnqueueService {
        EnqueueService::new(self.store.clone(), registry, self.clock.clone())
    }

    /// Enqueue a `test.job` due now on `queue`
    pub async fn enqueue(&self, queue: Queue) -> JobId {
        self.store
            .enqueue(NewJob::new(
                queue,
                JobType::new(JOB_TYPE),
                JobPayload::empty(),
                self.clock.now_millis(),
            ))
            .await
            .unwrap()
    }

    pub async fn job(&self, id: JobId) -> Job {
        self.store.find_by_id(id).await.unwrap().unwrap()
    }

    pub async fn store_count(&self, queue: Queue, state: JobState) -> i64 {
        self.store.count_by_state(queue, state).await.unwrap()
    }
}

/// Token whose sender is kept alive for the rest of the test
pub fn token() -> ShutdownToken {
    let (tx, token) = shutdown_channel();
    std::mem::forget(tx);
    token
}
