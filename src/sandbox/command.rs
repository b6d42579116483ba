//! Command execution seam.
//!
//! `CommandSandbox` is what the executor uses to actually run shell
//! commands. `LocalSandbox` runs them on this machine through `sh -c`, each
//! in its own process group so that a kill takes the whole command tree down.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Grace period for output readers once the process is gone.
const READER_GRACE: Duration = Duration::from_secs(1);

/// What to run and where.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Output of an inline command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when the command was killed for exceeding its timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}{}", self.stdout, self.stderr),
        }
    }
}

/// A process started in the background.
#[async_trait]
pub trait DetachedProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit code if the process has exited, None while it is alive.
    fn try_exit(&mut self) -> Result<Option<i32>>;

    /// Kill the process and everything in its process group.
    async fn kill(&mut self) -> Result<()>;
}

/// Runs shell commands.
#[async_trait]
pub trait CommandSandbox: Send + Sync {
    /// Run to completion, killing the command if it exceeds `timeout`.
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput>;

    /// Start without waiting. Stdout and stderr go to `log_path`.
    async fn start_detached(
        &self,
        spec: &CommandSpec,
        log_path: &Path,
    ) -> Result<Box<dyn DetachedProcess>>;
}

/// Runs commands on the local machine.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    shell: String,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&spec.command)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandSandbox for LocalSandbox {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
        debug!(command = %spec.command, ?timeout, "LocalSandbox::run");

        let mut child = self
            .command(spec)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SandboxStart(format!("{}: {}", spec.command, e)))?;

        let stdout = tokio::spawn(read_to_string(child.stdout.take()));
        let stderr = tokio::spawn(read_to_string(child.stderr.take()));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (Some(exit_code(status?)), false),
            Err(_) => {
                warn!(command = %spec.command, ?timeout, "Command timed out, killing");
                kill_process_group(&mut child).await;
                (None, true)
            }
        };

        Ok(CommandOutput {
            exit_code,
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
            timed_out,
        })
    }

    async fn start_detached(
        &self,
        spec: &CommandSpec,
        log_path: &Path,
    ) -> Result<Box<dyn DetachedProcess>> {
        debug!(command = %spec.command, log = %log_path.display(), "LocalSandbox::start_detached");

        let log = File::create(log_path)?;
        let child = self
            .command(spec)
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| Error::SandboxStart(format!("{}: {}", spec.command, e)))?;

        Ok(Box::new(LocalProcess { child }))
    }
}

/// A detached child owned by its supervisor.
#[derive(Debug)]
pub struct LocalProcess {
    child: Child,
}

#[async_trait]
impl DetachedProcess for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    async fn kill(&mut self) -> Result<()> {
        kill_process_group(&mut self.child).await;
        Ok(())
    }
}

/// Exit code, or 128 + signal number for a signalled process.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// SIGKILL the child's process group, then reap the child itself.
async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        let result = Command::new("kill")
            .arg("-KILL")
            .arg(format!("-{}", pid))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            debug!(pid, error = %e, "kill of process group failed");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child kill failed");
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        // Partial output is still useful after a read error.
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(handle: tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(output)) => output,
        _ => String::new(),
    }
}
