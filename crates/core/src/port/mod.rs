// Port Layer - Interfaces for external dependencies

pub mod budget_store;
pub mod handler;
pub mod id_provider; // For deterministic testing
pub mod job_store;
pub mod notifier;
pub mod telemetry;
pub mod time_provider;

// Re-exports
pub use budget_store::BudgetStore;
pub use handler::JobHandler;
pub use id_provider::IdProvider;
pub use job_store::{JobStore, StaleClaim};
pub use notifier::Notifier;
pub use telemetry::{JobEvent, JobEventKind, TelemetrySink};
pub use time_provider::TimeProvider;
