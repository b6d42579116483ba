//! Agent identity and the invocation seam.
//!
//! Deciding *what* code or command to produce is delegated to an external
//! agent. `AgentInvoker` is the narrow interface the executors call;
//! `CommandAgent` drives a headless agent CLI (one process per prompt) and
//! parses its JSON result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::config::AgentConfig;
use crate::core::NodeId;
use crate::error::{Error, Result};

/// Identifier of a participating agent.
///
/// Agent ids end up in branch names, ref names and directory names, so they
/// are restricted to ASCII alphanumerics, `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(id))
        } else {
            Err(Error::InvalidAgentId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AgentId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// What the agent is working on when it is invoked.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub node: NodeId,
    /// Directory the agent operates in (its worktree or the delivery line).
    pub working_dir: PathBuf,
    /// 1 for the first dispatch, incremented for each re-implementation or fix.
    pub attempt: u32,
}

impl AgentContext {
    pub fn new(node: NodeId, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            node,
            working_dir: working_dir.into(),
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: String,
    pub success: bool,
}

impl AgentResponse {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
        }
    }
}

/// Invokes an agent with a prompt. Awaited by the dispatching executor.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentId,
        prompt: &str,
        context: &AgentContext,
    ) -> Result<AgentResponse>;
}

/// Internal struct for deserializing a headless agent's JSON result.
#[derive(Debug, Deserialize)]
struct RawAgentResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Runs a headless agent CLI per invocation.
///
/// The configured command is split on whitespace and the prompt is appended
/// as the final argument. The process runs in the context's working
/// directory with `WEAVE_AGENT_ID` and `WEAVE_NODE_ID` set.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    base_command: Vec<String>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            base_command: config
                .command
                .split_whitespace()
                .map(String::from)
                .collect(),
            timeout: config.timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    pub fn command(&self, prompt: &str) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        cmd.push(prompt.to_string());
        cmd
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Parse the agent's stdout.
    ///
    /// JSON output with a `result`/`error` field is interpreted; anything
    /// else is taken verbatim and success follows the exit status.
    pub fn parse_output(stdout: &str, exit_ok: bool) -> AgentResponse {
        if let Ok(raw) = serde_json::from_str::<RawAgentResponse>(stdout.trim()) {
            let failed = raw.is_error
                || raw.subtype.as_deref().is_some_and(|s| s.starts_with("error"))
                || (raw.result.is_none() && raw.error.is_some());
            let content = if failed {
                raw.error.or(raw.result).unwrap_or_default()
            } else {
                raw.result.unwrap_or_default()
            };
            return AgentResponse {
                content,
                success: exit_ok && !failed,
            };
        }
        AgentResponse {
            content: stdout.trim().to_string(),
            success: exit_ok,
        }
    }

    fn program(&self) -> Result<(&str, &[String])> {
        match self.base_command.split_first() {
            Some((bin, args)) => Ok((bin.as_str(), args)),
            None => Err(Error::Agent("agent command is empty".to_string())),
        }
    }
}

impl Default for CommandAgent {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

#[async_trait]
impl AgentInvoker for CommandAgent {
    async fn invoke(
        &self,
        agent: &AgentId,
        prompt: &str,
        context: &AgentContext,
    ) -> Result<AgentResponse> {
        let (bin, args) = self.program()?;
        debug!(
            %agent,
            node = %context.node,
            attempt = context.attempt,
            cwd = %context.working_dir.display(),
            "CommandAgent::invoke"
        );

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(bin)
                .args(args)
                .arg(prompt)
                .current_dir(ensure_dir(&context.working_dir)?)
                .env("WEAVE_AGENT_ID", agent.as_str())
                .env("WEAVE_NODE_ID", context.node.as_str())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(|e| Error::Agent(format!("failed to run {}: {}", bin, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut response = Self::parse_output(&stdout, output.status.success());
        if !response.success && response.content.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            response.content = if stderr.trim().is_empty() {
                format!(
                    "agent exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
        }
        Ok(response)
    }
}

fn ensure_dir(path: &Path) -> Result<&Path> {
    if path.is_dir() {
        Ok(path)
    } else {
        Err(Error::Agent(format!(
            "working directory does not exist: {}",
            path.display()
        )))
    }
}
