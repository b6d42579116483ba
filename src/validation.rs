//! Validation of the delivery line after an agent's change is applied.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::AgentId;
use crate::config::ValidationConfig;
use crate::core::TaskNode;
use crate::sandbox::{SandboxTask, SandboxTaskExecutor, SubmitOptions};
use crate::util::tail;
use crate::Result;

/// Output kept in a failure report.
const REPORT_TAIL: usize = 4000;
/// Extra time given to the executor beyond the command's own timeout.
const WAIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    /// Human-readable details, handed to the agent on failure.
    pub report: String,
}

impl ValidationReport {
    pub fn pass(report: impl Into<String>) -> Self {
        Self {
            passed: true,
            report: report.into(),
        }
    }

    pub fn fail(report: impl Into<String>) -> Self {
        Self {
            passed: false,
            report: report.into(),
        }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        node: &TaskNode,
        agent: &AgentId,
        delivery_path: &Path,
    ) -> Result<ValidationReport>;
}

/// Accepts every change.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPass;

#[async_trait]
impl Validator for AlwaysPass {
    async fn validate(
        &self,
        _node: &TaskNode,
        _agent: &AgentId,
        _delivery_path: &Path,
    ) -> Result<ValidationReport> {
        Ok(ValidationReport::pass("no validation configured"))
    }
}

/// Runs a shell command in the delivery worktree; exit code 0 passes.
pub struct CommandValidator {
    executor: Arc<SandboxTaskExecutor>,
    command: String,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(executor: Arc<SandboxTaskExecutor>, command: &str, timeout: Duration) -> Self {
        Self {
            executor,
            command: command.to_string(),
            timeout,
        }
    }

    /// `CommandValidator` when a command is configured, `AlwaysPass` otherwise.
    pub fn from_config(
        executor: Arc<SandboxTaskExecutor>,
        config: &ValidationConfig,
    ) -> Arc<dyn Validator> {
        match config.command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => {
                Arc::new(Self::new(executor, command, config.timeout()))
            }
            _ => Arc::new(AlwaysPass),
        }
    }

    fn report(task: &SandboxTask) -> String {
        let mut report = format!("`{}` finished with status {}", task.command, task.status);
        if let Some(code) = task.exit_code {
            report.push_str(&format!(" (exit code {})", code));
        }
        let output = task.output.trim();
        if !output.is_empty() {
            report.push_str("\n\n");
            report.push_str(tail(output, REPORT_TAIL));
        }
        report
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate(
        &self,
        node: &TaskNode,
        agent: &AgentId,
        delivery_path: &Path,
    ) -> Result<ValidationReport> {
        debug!(node = %node.id, %agent, command = %self.command, "CommandValidator::validate");
        let options = SubmitOptions::new()
            .timeout(self.timeout)
            .working_dir(delivery_path)
            .env("WEAVE_NODE_ID", node.id.as_str())
            .env("WEAVE_AGENT_ID", agent.as_str());
        let id = self.executor.submit(&self.command, options).await?;
        let task = self.executor.wait(id, self.timeout + WAIT_GRACE).await?;

        let passed = task.is_success();
        info!(node = %node.id, %agent, passed, status = %task.status, "Validation finished");
        let report = Self::report(&task);
        Ok(if passed {
            ValidationReport::pass(report)
        } else {
            ValidationReport::fail(report)
        })
    }
}
