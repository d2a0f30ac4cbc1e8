// Conveyor Infrastructure - System Adapters
// Implements: JobHandler (external commands)

pub mod command_handler;

pub use command_handler::CommandHandler;
