//! Terminal-session orchestration: PTY-backed panes, live log classification,
//! threshold triggers and durable session recovery.

// Prevent accidental direct writes to stdout/stderr in library code; the
// driver binary owns stdout as its protocol stream.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod address;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exec;
pub mod monitor;
pub mod ops;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod watcher;

pub use address::PaneAddress;
pub use address::WindowAddress;
pub use config::OrchestratorConfig;
pub use error::ErrorKind;
pub use error::OrchestratorError;
pub use error::Result;
pub use ops::Operation;
pub use ops::OperationResponse;
pub use ops::dispatch;
pub use orchestrator::Orchestrator;
pub use orchestrator::OrchestratorBuilder;
