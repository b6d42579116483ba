//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted agents that edit files instead of calling a model
//! - Scripted validators
//! - A config pointing every directory into the test's temp dir

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use weave::agent::{AgentContext, AgentId, AgentInvoker, AgentResponse};
use weave::config::{Config, SandboxConfig};
use weave::core::TaskNode;
use weave::validation::{ValidationReport, Validator};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");

        git(&path, &["init"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Directory next to the repo for worktrees and sandbox artifacts.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Config with worktrees and artifacts under the temp dir and fast polling.
    pub fn config(&self) -> Config {
        Config {
            worktree_dir: Some(self.scratch("worktrees").to_string_lossy().into_owned()),
            sandbox: SandboxConfig {
                poll_interval_ms: 20,
                dependency_backoff_ms: 10,
                default_timeout_secs: 30,
                artifacts_dir: Some(self.scratch("artifacts").to_string_lossy().into_owned()),
                long_running_patterns: vec![r"^sleep\b".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Subjects of the commits on `branch`, newest first.
    pub fn log_subjects(&self, branch: &str) -> Vec<String> {
        git(&self.path, &["log", "--format=%s", branch])
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Content of `file` at the tip of `branch`, if it exists there.
    pub fn show_file(&self, branch: &str, file: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{}:{}", branch, file)])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git show");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn rev_parse(&self, rev: &str) -> String {
        git(&self.path, &["rev-parse", rev]).trim().to_string()
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        !git(&self.path, &["branch", "--list", name]).trim().is_empty()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Run git in `dir`, panicking on failure. Returns stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn agent(id: &str) -> AgentId {
    AgentId::new(id).expect("valid agent id")
}

/// `lines` numbered lines, prefixed with `tag`.
pub fn lines(tag: &str, count: usize) -> String {
    (0..count).map(|i| format!("{} line {}\n", tag, i)).collect()
}

/// One recorded agent invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub agent: AgentId,
    pub prompt: String,
    pub node: String,
    pub attempt: u32,
    pub working_dir: PathBuf,
}

type Script = Box<dyn Fn(&Invocation) -> AgentResponse + Send + Sync>;

/// Agent that runs a closure against its working directory.
pub struct ScriptedAgent {
    script: Script,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedAgent {
    pub fn new(script: impl Fn(&Invocation) -> AgentResponse + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, id: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.agent.as_str() == id)
            .collect()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(
        &self,
        agent: &AgentId,
        prompt: &str,
        context: &AgentContext,
    ) -> weave::Result<AgentResponse> {
        let invocation = Invocation {
            agent: agent.clone(),
            prompt: prompt.to_string(),
            node: context.node.to_string(),
            attempt: context.attempt,
            working_dir: context.working_dir.clone(),
        };
        let response = (self.script)(&invocation);
        self.calls.lock().unwrap().push(invocation);
        Ok(response)
    }
}

/// Write `content` to `file` inside the invocation's working directory.
pub fn write(invocation: &Invocation, file: &str, content: &str) {
    let path = invocation.working_dir.join(file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(path, content).expect("Failed to write agent file");
}

/// Validator returning scripted results per agent; passes once a script
/// runs out.
#[derive(Default)]
pub struct ScriptedValidator {
    results: Mutex<HashMap<AgentId, Vec<bool>>>,
    calls: Mutex<Vec<AgentId>>,
}

impl ScriptedValidator {
    pub fn script(self, id: &str, results: &[bool]) -> Self {
        self.results
            .lock()
            .unwrap()
            .insert(agent(id), results.iter().rev().copied().collect());
        self
    }

    pub fn calls(&self) -> Vec<AgentId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(
        &self,
        _node: &TaskNode,
        agent: &AgentId,
        _delivery_path: &Path,
    ) -> weave::Result<ValidationReport> {
        self.calls.lock().unwrap().push(agent.clone());
        let passed = self
            .results
            .lock()
            .unwrap()
            .get_mut(agent)
            .and_then(Vec::pop)
            .unwrap_or(true);
        Ok(if passed {
            ValidationReport::pass("ok")
        } else {
            ValidationReport::fail(format!("check failed for {}", agent))
        })
    }
}
