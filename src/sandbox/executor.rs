//! Background command executor.
//!
//! One dispatch loop per executor pulls submitted tasks off a FIFO queue,
//! resolves their dependencies and runs them. Short commands run inline in
//! the loop; long-running ones are started detached and handed to a
//! supervisor task that owns the child until it exits, times out or the
//! executor shuts down. Every task lives in a `watch` channel so waiters see
//! state changes without polling.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::sandbox::classify::CommandClassifier;
use crate::sandbox::command::{CommandSandbox, CommandSpec, DetachedProcess, LocalSandbox};
use crate::sandbox::task::{SandboxStatus, SandboxTask, SandboxTaskId, SubmitOptions, TaskError};
use crate::{Error, Result};

type TaskCell = Arc<watch::Sender<SandboxTask>>;

#[derive(Debug, Clone)]
struct Settings {
    poll_interval: Duration,
    dependency_backoff: Duration,
    default_timeout: Duration,
    retention: Duration,
    artifacts_dir: PathBuf,
}

impl From<&SandboxConfig> for Settings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            dependency_backoff: config.dependency_backoff(),
            default_timeout: config.default_timeout(),
            retention: config.retention(),
            artifacts_dir: config.artifacts_dir(),
        }
    }
}

enum Dependencies {
    Satisfied,
    Waiting,
    Failed(SandboxTaskId),
    /// The task itself is gone or no longer Pending.
    Skip,
}

/// Runs submitted shell commands in the background.
///
/// Must be created inside a tokio runtime; the dispatch loop is spawned on
/// construction and stopped by [`shutdown`](Self::shutdown) or drop.
pub struct SandboxTaskExecutor {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    sandbox: Arc<dyn CommandSandbox>,
    classifier: CommandClassifier,
    settings: Settings,
    tasks: RwLock<HashMap<SandboxTaskId, TaskCell>>,
    queue: Mutex<VecDeque<SandboxTaskId>>,
    wake: Notify,
    cancel: CancellationToken,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl SandboxTaskExecutor {
    pub fn new(sandbox: Arc<dyn CommandSandbox>, config: &SandboxConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            sandbox,
            classifier: CommandClassifier::new(&config.long_running_patterns)?,
            settings: Settings::from(config),
            tasks: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            supervisors: Mutex::new(Vec::new()),
        });

        debug!(
            artifacts_dir = %inner.settings.artifacts_dir.display(),
            "SandboxTaskExecutor::new"
        );
        let dispatcher = tokio::spawn(Arc::clone(&inner).dispatch_loop());

        Ok(Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Executor backed by [`LocalSandbox`].
    pub fn local(config: &SandboxConfig) -> Result<Self> {
        Self::new(Arc::new(LocalSandbox::new()), config)
    }

    /// Register a command and queue it for execution.
    ///
    /// Returns as soon as the task is queued.
    pub async fn submit(&self, command: &str, options: SubmitOptions) -> Result<SandboxTaskId> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::ExecutorShutdown);
        }

        let timeout = options.timeout.unwrap_or(self.inner.settings.default_timeout);
        let task = SandboxTask::new(command, timeout, options);
        let id = task.id;
        debug!(task = %id.short(), command, deps = task.depends_on.len(), "Sandbox task submitted");

        let (tx, _) = watch::channel(task);
        self.inner.tasks.write().await.insert(id, Arc::new(tx));
        self.inner.queue.lock().await.push_back(id);
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Submit several commands sharing `options`.
    ///
    /// With `stop_on_error` each command depends on the previous one, so a
    /// failure fails the rest of the chain without running it.
    pub async fn submit_chain(
        &self,
        commands: &[String],
        stop_on_error: bool,
        options: SubmitOptions,
    ) -> Result<Vec<SandboxTaskId>> {
        let mut ids: Vec<SandboxTaskId> = Vec::with_capacity(commands.len());
        for command in commands {
            let mut task_options = options.clone();
            if stop_on_error {
                if let Some(&previous) = ids.last() {
                    task_options = task_options.depends_on(previous);
                }
            }
            ids.push(self.submit(command, task_options).await?);
        }
        Ok(ids)
    }

    /// Wait until the task reaches a terminal status.
    ///
    /// # Errors
    /// `WaitTimeout` if `timeout` elapses first (the task keeps running) and
    /// `SandboxTaskNotFound` for unknown or evicted ids.
    pub async fn wait(&self, id: SandboxTaskId, timeout: Duration) -> Result<SandboxTask> {
        let mut rx = self
            .inner
            .cell(id)
            .await
            .ok_or(Error::SandboxTaskNotFound(id))?
            .subscribe();

        match tokio::time::timeout(timeout, rx.wait_for(|task| task.is_finished())).await {
            Ok(Ok(task)) => Ok(task.clone()),
            Ok(Err(_)) => Err(Error::SandboxTaskNotFound(id)),
            Err(_) => Err(Error::WaitTimeout {
                task: id,
                waited: timeout,
            }),
        }
    }

    /// Wait for every task, each with the same timeout.
    pub async fn wait_all(
        &self,
        ids: &[SandboxTaskId],
        timeout: Duration,
    ) -> Result<Vec<SandboxTask>> {
        join_all(ids.iter().map(|&id| self.wait(id, timeout)))
            .await
            .into_iter()
            .collect()
    }

    /// Cancel a task that has not started. Returns false otherwise.
    pub async fn cancel(&self, id: SandboxTaskId) -> bool {
        let Some(cell) = self.inner.cell(id).await else {
            return false;
        };
        let cancelled = cell.send_if_modified(|task| {
            task.status == SandboxStatus::Pending && task.cancel()
        });
        if cancelled {
            info!(task = %id.short(), "Sandbox task cancelled");
        }
        cancelled
    }

    pub async fn get(&self, id: SandboxTaskId) -> Option<SandboxTask> {
        self.inner.cell(id).await.map(|cell| cell.borrow().clone())
    }

    /// Snapshots of every registered task, oldest first.
    pub async fn list(&self) -> Vec<SandboxTask> {
        let mut tasks: Vec<SandboxTask> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .map(|cell| cell.borrow().clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Evict terminal tasks older than the retention window.
    pub async fn prune_expired(&self) -> usize {
        self.inner.prune_expired().await
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop the dispatch loop, kill every outstanding process and mark all
    /// non-terminal tasks Cancelled.
    pub async fn shutdown(&self) {
        info!("Shutting down sandbox executor");
        self.inner.cancel.cancel();

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch loop ended abnormally");
            }
        }

        let supervisors = std::mem::take(&mut *self.inner.supervisors.lock().await);
        join_all(supervisors).await;

        self.inner.queue.lock().await.clear();
        for cell in self.inner.tasks.read().await.values() {
            cell.send_if_modified(|task| task.cancel());
        }
    }
}

impl Drop for SandboxTaskExecutor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn cell(&self, id: SandboxTaskId) -> Option<TaskCell> {
        self.tasks.read().await.get(&id).cloned()
    }

    async fn dispatch_loop(self: Arc<Self>) {
        debug!("Sandbox dispatch loop started");
        // Consecutive re-queues without any task moving forward.
        let mut stalled = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.prune_expired().await;

            let next = self.queue.lock().await.pop_front();
            let Some(id) = next else {
                stalled = 0;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
                continue;
            };

            match self.dependencies(id).await {
                Dependencies::Skip => stalled = 0,
                Dependencies::Failed(dependency) => {
                    stalled = 0;
                    if let Some(cell) = self.cell(id).await {
                        debug!(task = %id.short(), dependency = %dependency.short(), "Dependency did not succeed");
                        record(&cell, |task| task.fail(TaskError::DependencyFailed { dependency }));
                    }
                }
                Dependencies::Waiting => {
                    let queued = {
                        let mut queue = self.queue.lock().await;
                        queue.push_back(id);
                        queue.len()
                    };
                    stalled += 1;
                    if stalled >= queued {
                        stalled = 0;
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = self.wake.notified() => {}
                            _ = tokio::time::sleep(self.settings.dependency_backoff) => {}
                        }
                    }
                }
                Dependencies::Satisfied => {
                    stalled = 0;
                    self.dispatch(id).await;
                }
            }
        }
        debug!("Sandbox dispatch loop stopped");
    }

    async fn dependencies(&self, id: SandboxTaskId) -> Dependencies {
        let tasks = self.tasks.read().await;
        let Some(cell) = tasks.get(&id) else {
            return Dependencies::Skip;
        };
        let (status, depends_on) = {
            let task = cell.borrow();
            (task.status, task.depends_on.clone())
        };
        if status != SandboxStatus::Pending {
            return Dependencies::Skip;
        }

        let mut waiting = false;
        for dependency in depends_on {
            match tasks.get(&dependency).map(|dep| dep.borrow().status) {
                Some(SandboxStatus::Success) => {}
                Some(SandboxStatus::Pending | SandboxStatus::Running) => waiting = true,
                // Unknown, evicted, or terminal without success.
                _ => return Dependencies::Failed(dependency),
            }
        }
        if waiting {
            Dependencies::Waiting
        } else {
            Dependencies::Satisfied
        }
    }

    async fn dispatch(self: &Arc<Self>, id: SandboxTaskId) {
        let Some(cell) = self.cell(id).await else {
            return;
        };
        let long_running = self.classifier.is_long_running(&cell.borrow().command);
        if !cell.send_if_modified(|task| task.start(long_running)) {
            return;
        }

        let (spec, timeout) = {
            let task = cell.borrow();
            let spec = CommandSpec::new(&task.command)
                .with_working_dir(task.working_dir.clone())
                .with_env(task.env.clone());
            (spec, task.timeout)
        };
        info!(task = %id.short(), command = %spec.command, long_running, "Dispatching sandbox task");

        if long_running {
            self.start_supervised(cell, spec, timeout).await;
        } else {
            self.run_inline(&cell, &spec, timeout).await;
        }
    }

    async fn run_inline(&self, cell: &TaskCell, spec: &CommandSpec, timeout: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                record(cell, |task| task.cancel());
            }
            result = self.sandbox.run(spec, timeout) => match result {
                Ok(output) if output.timed_out => {
                    record(cell, |task| task.time_out(output.combined()));
                }
                Ok(output) => {
                    let code = output.exit_code.unwrap_or(-1);
                    record(cell, |task| task.finish(code, output.combined()));
                }
                Err(e) => record(cell, |task| task.fail(start_error(e))),
            }
        }
    }

    async fn start_supervised(self: &Arc<Self>, cell: TaskCell, spec: CommandSpec, timeout: Duration) {
        let id = cell.borrow().id;
        let log_path = self.settings.artifacts_dir.join(format!("{}.log", id));

        let started: Result<Box<dyn DetachedProcess>> = async {
            tokio::fs::create_dir_all(&self.settings.artifacts_dir).await?;
            self.sandbox.start_detached(&spec, &log_path).await
        }
        .await;

        let process = match started {
            Ok(process) => process,
            Err(e) => {
                warn!(task = %id.short(), error = %e, "Failed to start detached command");
                record(&cell, |task| task.fail(start_error(e)));
                remove_log(&log_path).await;
                return;
            }
        };
        debug!(task = %id.short(), pid = ?process.pid(), "Detached command started");

        let inner = Arc::clone(self);
        let handle = tokio::spawn(inner.supervise(cell, process, log_path, timeout));

        let mut supervisors = self.supervisors.lock().await;
        supervisors.retain(|handle| !handle.is_finished());
        supervisors.push(handle);
    }

    /// Own a detached process until it exits, times out or the executor
    /// shuts down.
    async fn supervise(
        self: Arc<Self>,
        cell: TaskCell,
        mut process: Box<dyn DetachedProcess>,
        log_path: PathBuf,
        timeout: Duration,
    ) {
        let id = cell.borrow().id;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    kill(process.as_mut(), id).await;
                    record(&cell, |task| task.cancel());
                    break;
                }
                _ = &mut deadline => {
                    warn!(task = %id.short(), ?timeout, "Detached command timed out, killing");
                    kill(process.as_mut(), id).await;
                    let output = read_log(&log_path).await;
                    record(&cell, |task| task.time_out(output));
                    break;
                }
                _ = poll.tick() => match process.try_exit() {
                    Ok(Some(code)) => {
                        let output = read_log(&log_path).await;
                        record(&cell, |task| task.finish(code, output));
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        kill(process.as_mut(), id).await;
                        let message = e.to_string();
                        record(&cell, |task| task.fail(TaskError::Supervision { message }));
                        break;
                    }
                },
            }
        }

        remove_log(&log_path).await;
        self.wake.notify_one();
    }

    async fn prune_expired(&self) -> usize {
        let retention = self.settings.retention;
        let now = Utc::now();
        let expired: Vec<SandboxTaskId> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|(_, cell)| {
                cell.borrow()
                    .completed_at
                    .and_then(|completed| (now - completed).to_std().ok())
                    .is_some_and(|age| age >= retention)
            })
            .map(|(id, _)| *id)
            .collect();

        if expired.is_empty() {
            return 0;
        }
        let mut tasks = self.tasks.write().await;
        for id in &expired {
            tasks.remove(id);
        }
        debug!(count = expired.len(), "Evicted expired sandbox tasks");
        expired.len()
    }
}

/// Apply a state change and log it if it took effect.
fn record(cell: &watch::Sender<SandboxTask>, apply: impl FnOnce(&mut SandboxTask) -> bool) {
    if cell.send_if_modified(apply) {
        let task = cell.borrow();
        info!(
            task = %task.id.short(),
            status = %task.status,
            exit_code = ?task.exit_code,
            "Sandbox task finished"
        );
    }
}

fn start_error(error: Error) -> TaskError {
    match error {
        Error::SandboxStart(message) => TaskError::SandboxStart { message },
        other => TaskError::SandboxStart {
            message: other.to_string(),
        },
    }
}

async fn kill(process: &mut dyn DetachedProcess, id: SandboxTaskId) {
    if let Err(e) = process.kill().await {
        warn!(task = %id.short(), error = %e, "Failed to kill detached command");
    }
}

async fn read_log(path: &std::path::Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}

async fn remove_log(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to remove task log");
        }
    }
}
