// Conveyor Core - Domain Logic, Ports & Dispatch Services
// NO infrastructure dependencies: storage, transports and handlers plug in through ports

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
