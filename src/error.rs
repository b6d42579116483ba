use std::time::Duration;

use thiserror::Error;

use crate::core::NodeId;
use crate::sandbox::SandboxTaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Task graph contains a cycle through: {}", format_ids(.unordered))]
    CyclicGraph { unordered: Vec<NodeId> },

    #[error("Duplicate node: {0}")]
    DuplicateNode(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Invalid transition for node {node}: {from} -> {to}")]
    InvalidTransition {
        node: NodeId,
        from: String,
        to: String,
    },

    #[error("Timed out after {waited:?} waiting for sandbox task {task}")]
    WaitTimeout {
        task: SandboxTaskId,
        waited: Duration,
    },

    #[error("Failed to start command: {0}")]
    SandboxStart(String),

    #[error("Sandbox task not found: {0}")]
    SandboxTaskNotFound(SandboxTaskId),

    #[error("Sandbox executor has been shut down")]
    ExecutorShutdown,

    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
