//! Sandbox executor tests against real processes.

use std::process::Command;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use weave::config::SandboxConfig;
use weave::sandbox::{SandboxStatus, SandboxTaskExecutor, SubmitOptions, TaskError};
use weave::Error;

fn config(dir: &std::path::Path) -> SandboxConfig {
    SandboxConfig {
        poll_interval_ms: 20,
        dependency_backoff_ms: 10,
        artifacts_dir: Some(dir.join("artifacts").to_string_lossy().into_owned()),
        long_running_patterns: vec![r"^sleep\b".to_string(), r"pidfile".to_string()],
        ..Default::default()
    }
}

fn is_alive(pid: &str) -> bool {
    Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_independent_task_overtakes_dependency_chain() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxTaskExecutor::local(&config(dir.path())).unwrap();

    let first = executor
        .submit("sleep 1 && echo one", SubmitOptions::new())
        .await
        .unwrap();
    let second = executor
        .submit("echo two", SubmitOptions::new().depends_on(first))
        .await
        .unwrap();
    let third = executor.submit("echo three", SubmitOptions::new()).await.unwrap();

    let done = executor.wait(third, Duration::from_secs(5)).await.unwrap();
    assert_eq!(done.status, SandboxStatus::Success);
    assert_eq!(done.output.trim(), "three");

    // The chain is still in flight when the independent task has finished.
    assert_eq!(executor.get(first).await.unwrap().status, SandboxStatus::Running);
    assert_eq!(executor.get(second).await.unwrap().status, SandboxStatus::Pending);

    let second = executor.wait(second, Duration::from_secs(5)).await.unwrap();
    assert_eq!(second.status, SandboxStatus::Success);
    let first = executor.get(first).await.unwrap();
    assert!(first.completed_at.unwrap() <= second.started_at.unwrap());

    executor.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_detached_process_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxTaskExecutor::local(&config(dir.path())).unwrap();
    let pidfile = dir.path().join("pidfile");

    let id = executor
        .submit(
            &format!("echo $$ > {}; exec sleep 30", pidfile.display()),
            SubmitOptions::new().timeout(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    let task = executor.wait(id, Duration::from_secs(10)).await.unwrap();

    assert_eq!(task.status, SandboxStatus::Timeout);
    assert!(matches!(task.error, Some(TaskError::TimedOut { .. })));
    let pid = std::fs::read_to_string(&pidfile).unwrap();
    assert!(!is_alive(pid.trim()));

    executor.shutdown().await;
}

#[tokio::test]
async fn test_timed_out_inline_command_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxTaskExecutor::local(&config(dir.path())).unwrap();
    let marker = dir.path().join("marker");

    let id = executor
        .submit(
            &format!("echo $$ > {}; exec tail -f /dev/null", marker.display()),
            SubmitOptions::new().timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap();
    let task = executor.wait(id, Duration::from_secs(10)).await.unwrap();

    assert_eq!(task.status, SandboxStatus::Timeout);
    let pid = std::fs::read_to_string(&marker).unwrap();
    assert!(!is_alive(pid.trim()));

    executor.shutdown().await;
}

#[tokio::test]
async fn test_failed_chain_never_runs_later_steps() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxTaskExecutor::local(&config(dir.path())).unwrap();
    let witness = dir.path().join("ran");

    let commands = vec![
        "echo build".to_string(),
        "exit 3".to_string(),
        format!("touch {}", witness.display()),
    ];
    let ids = executor
        .submit_chain(&commands, true, SubmitOptions::new())
        .await
        .unwrap();
    let tasks = executor.wait_all(&ids, Duration::from_secs(5)).await.unwrap();

    assert_eq!(tasks[0].status, SandboxStatus::Success);
    assert_eq!(tasks[1].status, SandboxStatus::Failed);
    assert_eq!(tasks[1].exit_code, Some(3));
    assert_eq!(tasks[2].status, SandboxStatus::Failed);
    assert!(tasks[2].started_at.is_none());
    assert!(matches!(
        tasks[2].error,
        Some(TaskError::DependencyFailed { dependency }) if dependency == ids[1]
    ));
    assert!(!witness.exists());

    executor.shutdown().await;
}

#[tokio::test]
async fn test_wait_timeout_leaves_task_running() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxTaskExecutor::local(&config(dir.path())).unwrap();

    let id = executor
        .submit("sleep 0.5 && echo late", SubmitOptions::new())
        .await
        .unwrap();
    let err = assert_err!(executor.wait(id, Duration::from_millis(50)).await);
    assert!(matches!(err, Error::WaitTimeout { .. }));

    let task = assert_ok!(executor.wait(id, Duration::from_secs(5)).await);
    assert_eq!(task.status, SandboxStatus::Success);
    assert_eq!(task.output.trim(), "late");

    executor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_kills_outstanding_processes() {
    let dir = tempfile::tempdir().unwrap();
    let executor = SandboxTaskExecutor::local(&config(dir.path())).unwrap();
    let pidfile = dir.path().join("pidfile");

    let running = executor
        .submit(
            &format!("echo $$ > {}; exec sleep 30", pidfile.display()),
            SubmitOptions::new(),
        )
        .await
        .unwrap();
    let queued = executor
        .submit("echo never", SubmitOptions::new().depends_on(running))
        .await
        .unwrap();

    for _ in 0..100 {
        if pidfile.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let pid = std::fs::read_to_string(&pidfile).unwrap();

    executor.shutdown().await;

    assert_eq!(executor.get(running).await.unwrap().status, SandboxStatus::Cancelled);
    assert_eq!(executor.get(queued).await.unwrap().status, SandboxStatus::Cancelled);
    assert!(!is_alive(pid.trim()));
    assert!(matches!(
        executor.submit("echo late", SubmitOptions::new()).await,
        Err(Error::ExecutorShutdown)
    ));
}
