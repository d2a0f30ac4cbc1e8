//! JSON-RPC API Layer
//!
//! Producer and administration surface of the Conveyor daemon:
//! `jobs.enqueue.v1`, `jobs.get.v1`, `budget.status.v1`,
//! `budget.set_ceiling.v1`, `budget.record_usage.v1` and `queues.stats.v1`.

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use handler::RpcHandler;
pub use server::{RpcServer, RpcServerConfig};
