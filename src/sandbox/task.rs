//! Sandbox task data model.
//!
//! A `SandboxTask` is one shell command submitted to a
//! [`SandboxTaskExecutor`](super::SandboxTaskExecutor). Tasks are owned by the
//! executor's registry; callers only ever see cloned snapshots.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a sandbox task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxTaskId(pub Uuid);

impl SandboxTaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, used for log file names and log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SandboxTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SandboxTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sandbox task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl SandboxStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SandboxStatus::Pending | SandboxStatus::Running)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Running => "running",
            SandboxStatus::Success => "success",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Timeout => "timeout",
            SandboxStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskError {
    #[error("dependency {dependency} did not succeed")]
    DependencyFailed { dependency: SandboxTaskId },

    #[error("command could not be started: {message}")]
    SandboxStart { message: String },

    #[error("command exited with code {code}")]
    ExitCode { code: i32 },

    #[error("command exceeded its timeout of {}s", .after_secs)]
    TimedOut { after_secs: u64 },

    #[error("lost track of the process: {message}")]
    Supervision { message: String },

    #[error("cancelled")]
    Cancelled,
}

/// Submission options for a command.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Falls back to the executor's default timeout.
    pub timeout: Option<Duration>,
    pub depends_on: Vec<SandboxTaskId>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Recorded on the task; dispatch follows submission order.
    pub priority: i32,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, id: SandboxTaskId) -> Self {
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A submitted command and everything known about its execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxTask {
    pub id: SandboxTaskId,
    pub command: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub status: SandboxStatus,
    /// Combined stdout and stderr.
    pub output: String,
    pub exit_code: Option<i32>,
    pub depends_on: Vec<SandboxTaskId>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub priority: i32,
    /// Set at dispatch when the command was started detached.
    pub long_running: bool,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SandboxTask {
    pub fn new(command: &str, timeout: Duration, options: SubmitOptions) -> Self {
        Self {
            id: SandboxTaskId::new(),
            command: command.to_string(),
            timeout,
            status: SandboxStatus::Pending,
            output: String::new(),
            exit_code: None,
            depends_on: options.depends_on,
            working_dir: options.working_dir,
            env: options.env,
            priority: options.priority,
            long_running: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SandboxStatus::Success
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent running, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Pending → Running. Returns false if the task was no longer Pending.
    pub(crate) fn start(&mut self, long_running: bool) -> bool {
        if self.status != SandboxStatus::Pending {
            return false;
        }
        self.status = SandboxStatus::Running;
        self.long_running = long_running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Record process exit. Exit code 0 is Success.
    pub(crate) fn finish(&mut self, exit_code: i32, output: String) -> bool {
        if self.is_finished() {
            return false;
        }
        self.exit_code = Some(exit_code);
        self.output = output;
        if exit_code == 0 {
            self.terminate(SandboxStatus::Success, None)
        } else {
            self.terminate(SandboxStatus::Failed, Some(TaskError::ExitCode { code: exit_code }))
        }
    }

    pub(crate) fn time_out(&mut self, partial_output: String) -> bool {
        if self.is_finished() {
            return false;
        }
        self.output = partial_output;
        let after_secs = self.timeout.as_secs();
        self.terminate(SandboxStatus::Timeout, Some(TaskError::TimedOut { after_secs }))
    }

    pub(crate) fn fail(&mut self, error: TaskError) -> bool {
        self.terminate(SandboxStatus::Failed, Some(error))
    }

    pub(crate) fn cancel(&mut self) -> bool {
        self.terminate(SandboxStatus::Cancelled, Some(TaskError::Cancelled))
    }

    fn terminate(&mut self, status: SandboxStatus, error: Option<TaskError>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> SandboxTask {
        SandboxTask::new("echo hi", Duration::from_secs(5), SubmitOptions::new())
    }

    #[test]
    fn test_task_id_short() {
        let id = SandboxTaskId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().starts_with(&id.short()));
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = task();
        assert_eq!(task.status, SandboxStatus::Pending);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(!task.long_running);
    }

    #[test]
    fn test_started_at_only_on_running() {
        let mut task = task();
        assert!(task.fail(TaskError::DependencyFailed {
            dependency: SandboxTaskId::new()
        }));
        assert_eq!(task.status, SandboxStatus::Failed);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_some());
        // Terminal tasks never start.
        assert!(!task.start(false));
    }

    #[test]
    fn test_finish_maps_exit_code() {
        let mut ok = task();
        ok.start(false);
        ok.finish(0, "hi\n".to_string());
        assert!(ok.is_success());
        assert_eq!(ok.exit_code, Some(0));
        assert!(ok.error.is_none());
        assert!(ok.duration().is_some());

        let mut bad = task();
        bad.start(false);
        bad.finish(2, String::new());
        assert_eq!(bad.status, SandboxStatus::Failed);
        assert_eq!(bad.error, Some(TaskError::ExitCode { code: 2 }));
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut task = task();
        task.start(true);
        assert!(task.time_out("partial".to_string()));
        assert_eq!(task.status, SandboxStatus::Timeout);
        let snapshot = task.clone();

        assert!(!task.finish(0, "late".to_string()));
        assert!(!task.cancel());
        assert_eq!(task, snapshot);
    }

    #[test]
    fn test_submit_options_builder() {
        let dep = SandboxTaskId::new();
        let options = SubmitOptions::new()
            .timeout(Duration::from_secs(3))
            .depends_on(dep)
            .depends_on(dep)
            .env("CI", "1")
            .priority(5);
        assert_eq!(options.depends_on, vec![dep]);
        assert_eq!(options.env.get("CI").map(String::as_str), Some("1"));
        assert_eq!(options.priority, 5);
    }

    #[test]
    fn test_task_error_display() {
        assert_eq!(
            TaskError::ExitCode { code: 1 }.to_string(),
            "command exited with code 1"
        );
        assert_eq!(
            TaskError::TimedOut { after_secs: 2 }.to_string(),
            "command exceeded its timeout of 2s"
        );
    }

    #[test]
    fn test_task_serializes() {
        let json = serde_json::to_string(&task()).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"timeout\":5.0"));
    }
}
