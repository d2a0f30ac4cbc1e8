// Domain Layer - Pure business logic and entities

pub mod budget;
pub mod error;
pub mod job;
pub mod notification;
pub mod outcome;
pub mod queue;

// Re-exports
pub use budget::{BudgetPeriod, PeriodKey, Threshold, ThrottleState, UsageDelta};
pub use error::DomainError;
pub use job::{Job, JobId, JobPayload, JobState, JobType, NewJob, Priority, DEFAULT_MAX_ATTEMPTS};
pub use notification::{BudgetAlert, Channel, Escalation, EscalationPolicy, Notification, Sla};
pub use outcome::Outcome;
pub use queue::{Queue, QueueConfig};
