use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Directory holding agent and delivery worktrees.
    pub worktree_dir: Option<String>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub collaboration: CollaborationConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Settings for the background command executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// How often a detached process is checked for exit.
    pub poll_interval_ms: u64,
    /// Pause after a dispatch pass where every queued task was waiting on a dependency.
    pub dependency_backoff_ms: u64,
    pub default_timeout_secs: u64,
    /// How long terminal tasks stay queryable before eviction.
    pub retention_secs: u64,
    /// Where command log files live while a task runs.
    pub artifacts_dir: Option<String>,
    /// Extra regexes that mark a command as long-running.
    pub long_running_patterns: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            dependency_backoff_ms: 100,
            default_timeout_secs: 600,
            retention_secs: 3600,
            artifacts_dir: None,
            long_running_patterns: Vec::new(),
        }
    }
}

impl SandboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dependency_backoff(&self) -> Duration {
        Duration::from_millis(self.dependency_backoff_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        match &self.artifacts_dir {
            Some(dir) => expand_tilde(dir),
            None => std::env::temp_dir().join("weave-sandbox"),
        }
    }
}

/// Settings for the multi-agent merge protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationConfig {
    /// Fix attempts after the first failed validation.
    pub max_validation_retries: u32,
    /// Re-implementation attempts after cherry-pick conflicts.
    pub max_conflict_retries: u32,
    /// Reset the agent's worktree to the rolled-back delivery line before asking for a fix.
    pub resync_on_validation_failure: bool,
    pub delivery_branch: String,
    pub channel_capacity: usize,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            max_validation_retries: 2,
            max_conflict_retries: 10,
            resync_on_validation_failure: false,
            delivery_branch: "weave/delivery".to_string(),
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Headless agent command; the prompt is appended as the last argument.
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude -p --output-format json".to_string(),
            timeout_secs: 600,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Shell command run in the delivery worktree; no command means always pass.
    pub command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 900,
        }
    }
}

impl ValidationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_rounds: u32,
    /// Fraction of completed nodes required to accept a round.
    pub acceptance_threshold: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            acceptance_threshold: 1.0,
        }
    }
}

impl Config {
    pub fn weave_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".weave"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::weave_dir()?.join("weave.toml"))
    }

    /// Worktree root for a repository. Defaults to `<repo>/.weave/worktrees`.
    pub fn worktrees_dir(&self, repo: &Path) -> PathBuf {
        match &self.worktree_dir {
            Some(dir) => expand_tilde(dir),
            None => repo.join(".weave").join("worktrees"),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            worktree_dir = ?config.worktree_dir,
            agent = %config.agent.command,
            validation = ?config.validation.command,
            "Config loaded"
        );
        Ok(config)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
