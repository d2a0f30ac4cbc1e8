// Job registry: static job type -> (queue, priority, retry policy, handler) table
use crate::domain::{JobType, Priority, Queue, DEFAULT_MAX_ATTEMPTS};
use crate::error::{AppError, Result};
use crate::port::JobHandler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default base delay of the retry backoff (30s)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(30);

/// Default wall-clock limit of one handler invocation (5 minutes)
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Static properties of a job type
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub job_type: JobType,
    pub queue: Queue,
    pub priority: Priority,
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl JobDefinition {
    pub fn new(job_type: impl Into<String>, queue: Queue) -> Self {
        Self {
            job_type: JobType::new(job_type),
            queue,
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A definition together with its handler
#[derive(Clone)]
pub struct RegisteredJob {
    pub definition: JobDefinition,
    pub handler: Arc<dyn JobHandler>,
}

/// Resolved once at startup; read-only afterwards
#[derive(Clone, Default)]
pub struct JobRegistry {
    entries: HashMap<JobType, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type; each type maps to exactly one handler
    pub fn register(
        &mut self,
        definition: JobDefinition,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        if definition.max_attempts < 1 {
            return Err(AppError::Config(format!(
                "job type {} needs max_attempts >= 1",
                definition.job_type
            )));
        }
        if self.entries.contains_key(&definition.job_type) {
            return Err(AppError::Conflict(format!(
                "job type {} is already registered",
                definition.job_type
            )));
        }
        self.entries.insert(
            definition.job_type.clone(),
            RegisteredJob {
                definition,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, job_type: &JobType) -> Option<&RegisteredJob> {
        self.entries.get(job_type)
    }

    pub fn definition(&self, job_type: &JobType) -> Option<&JobDefinition> {
        self.entries.get(job_type).map(|e| &e.definition)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues that have at least one registered job type
    pub fn queues(&self) -> Vec<Queue> {
        let mut queues: Vec<Queue> = self.entries.values().map(|e| e.definition.queue).collect();
        queues.sort();
        queues.dedup();
        queues
    }

    /// Longest handler timeout; the stale-lock timeout must not be shorter
    pub fn longest_timeout(&self) -> Duration {
        self.entries
            .values()
            .map(|e| e.definition.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
