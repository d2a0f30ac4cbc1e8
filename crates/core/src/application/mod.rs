// Application Layer - Use Cases and Services

pub mod budget;
pub mod dispatcher;
pub mod enqueue;
pub mod escalation;
pub mod gate;
pub mod reaper;
pub mod registry;
pub mod retry;

// Re-exports
pub use budget::{BudgetConfig, BudgetGovernor, BudgetStatus};
pub use dispatcher::{
    shutdown_channel, CycleReport, Dispatcher, DispatcherConfig, DispatcherDeps, ShutdownSender,
    ShutdownToken,
};
pub use enqueue::{EnqueueRequest, EnqueueService};
pub use escalation::EscalationRouter;
pub use gate::{ConcurrencyGate, GatePermit};
pub use reaper::LockReaper;
pub use registry::{JobDefinition, JobRegistry};
pub use retry::{RetryDecision, RetryPlanner};
