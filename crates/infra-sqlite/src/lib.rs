// Conveyor Infrastructure - SQLite Adapter
// Implements: JobStore, BudgetStore

mod budget_store;
mod connection;
mod error;
mod job_store;
mod migration;

pub use budget_store::SqliteBudgetStore;
pub use connection::create_pool;
pub use job_store::SqliteJobStore;
pub use migration::run_migrations;

// Note: sqlx::Error conversion is handled by error::map_sqlx_error
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
