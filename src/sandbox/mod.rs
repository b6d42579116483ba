//! Background command execution.
//!
//! - `task`: the submitted command and its lifecycle
//! - `classify`: long-running command detection
//! - `command`: the process-spawning seam (`CommandSandbox`)
//! - `executor`: the dispatch loop and process supervision

pub mod classify;
pub mod command;
pub mod executor;
pub mod task;

pub use classify::CommandClassifier;
pub use command::{CommandOutput, CommandSandbox, CommandSpec, DetachedProcess, LocalSandbox};
pub use executor::SandboxTaskExecutor;
pub use task::{SandboxStatus, SandboxTask, SandboxTaskId, SubmitOptions, TaskError};
