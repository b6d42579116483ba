//! Collaborative execution against a real git repository.

use std::sync::Arc;
use std::time::Duration;

use weave::agent::AgentResponse;
use weave::collab::{
    AbandonReason, AgentOutcome, CollaborativeExecutor, GitWorkspace, Workspace,
};
use weave::config::Config;
use weave::core::TaskNode;
use weave::sandbox::SandboxTaskExecutor;
use weave::validation::{AlwaysPass, CommandValidator, Validator};

use crate::fixtures::{agent, lines, write, ScriptedAgent, ScriptedValidator, TestRepo};

const DELIVERY: &str = "weave/delivery";

fn node(agents: &[&str]) -> TaskNode {
    TaskNode::new("feature", "dev", "Build the feature").with_agents(agents.iter().map(|a| agent(a)).collect())
}

fn executor(
    repo: &TestRepo,
    config: &Config,
    agents: &Arc<ScriptedAgent>,
    validator: Arc<dyn Validator>,
) -> (Arc<GitWorkspace>, CollaborativeExecutor) {
    let workspace = Arc::new(GitWorkspace::from_config(&repo.path, config).unwrap());
    let executor = CollaborativeExecutor::new(
        workspace.clone(),
        agents.clone(),
        validator,
        config.collaboration.clone(),
    );
    (workspace, executor)
}

#[tokio::test]
async fn test_changes_integrated_largest_first() {
    let repo = TestRepo::new();
    let config = repo.config();
    let agents = Arc::new(ScriptedAgent::new(|call| {
        let size = match call.agent.as_str() {
            "small" => 10,
            "large" => 50,
            _ => 30,
        };
        write(call, &format!("{}.txt", call.agent), &lines(call.agent.as_str(), size));
        AgentResponse::success("done")
    }));
    let (_, executor) = executor(&repo, &config, &agents, Arc::new(AlwaysPass));

    let report = executor.execute(&node(&["small", "large", "medium"])).await.unwrap();

    let order: Vec<&str> = report.merge_order.iter().map(|s| s.agent.as_str()).collect();
    assert_eq!(order, vec!["large", "medium", "small"]);
    assert_eq!(report.integrated().len(), 3);
    assert!(report.succeeded());

    let subjects = repo.log_subjects(DELIVERY);
    assert_eq!(
        &subjects[..3],
        &[
            "[feature] small: dev".to_string(),
            "[feature] medium: dev".to_string(),
            "[feature] large: dev".to_string(),
        ]
    );
    for name in ["small", "medium", "large"] {
        assert!(repo.show_file(DELIVERY, &format!("{}.txt", name)).is_some());
    }
}

#[tokio::test]
async fn test_conflict_reimplemented_on_delivery_state() {
    let repo = TestRepo::new();
    let config = repo.config();
    let agents = Arc::new(ScriptedAgent::new(|call| {
        let path = call.working_dir.join("shared.txt");
        if call.prompt.contains("conflicted") {
            // Re-implementation on top of what is already integrated.
            let mut current = std::fs::read_to_string(&path).unwrap();
            current.push_str("b was here\n");
            std::fs::write(&path, current).unwrap();
        } else if call.agent.as_str() == "a" {
            write(call, "shared.txt", &lines("a", 20));
        } else {
            write(call, "shared.txt", &lines("b", 5));
        }
        AgentResponse::success("done")
    }));
    let (_, executor) = executor(&repo, &config, &agents, Arc::new(AlwaysPass));

    let report = executor.execute(&node(&["a", "b"])).await.unwrap();

    assert!(report.outcomes[&agent("a")].is_integrated());
    assert!(matches!(
        report.outcomes[&agent("b")],
        AgentOutcome::Integrated { attempts: 2, .. }
    ));

    let from_b = repo
        .log_subjects(DELIVERY)
        .into_iter()
        .filter(|s| s == "[feature] b: dev")
        .count();
    assert_eq!(from_b, 1);

    let shared = repo.show_file(DELIVERY, "shared.txt").unwrap();
    assert!(shared.starts_with("a line 0\n"));
    assert!(shared.ends_with("b was here\n"));
    assert!(!shared.contains("<<<<<<<"));
}

#[tokio::test]
async fn test_validation_fails_twice_then_passes() {
    let repo = TestRepo::new();
    let config = repo.config();
    let sandbox = Arc::new(SandboxTaskExecutor::local(&config.sandbox).unwrap());
    let validator: Arc<dyn Validator> = Arc::new(CommandValidator::new(
        sandbox.clone(),
        "grep -q fixed status.txt",
        Duration::from_secs(10),
    ));
    let agents = Arc::new(ScriptedAgent::new(|call| {
        if call.agent.as_str() == "other" {
            write(call, "other.txt", "other\n");
        } else {
            let status = if call.attempt >= 3 { "fixed" } else { "broken" };
            let content = format!("{} (attempt {})\n{}", status, call.attempt, lines("pad", 2));
            write(call, "status.txt", &content);
        }
        AgentResponse::success("done")
    }));
    let (workspace, executor) = executor(&repo, &config, &agents, validator);

    let report = executor.execute(&node(&["solo", "other"])).await.unwrap();

    let order: Vec<&str> = report.merge_order.iter().map(|s| s.agent.as_str()).collect();
    assert_eq!(order, vec!["solo", "other"]);
    assert!(matches!(
        report.outcomes[&agent("other")],
        AgentOutcome::Integrated { attempts: 1, .. }
    ));

    assert!(matches!(
        report.outcomes[&agent("solo")],
        AgentOutcome::Integrated { attempts: 3, .. }
    ));
    let fixes = agents.calls_for("solo");
    assert_eq!(fixes.len(), 3);
    assert!(fixes[1].prompt.contains("validation failed"));
    assert!(fixes[1].prompt.contains("grep -q fixed status.txt"));

    // Rolled-back attempts leave nothing behind on the delivery line.
    let subjects = repo.log_subjects(DELIVERY);
    assert_eq!(subjects.iter().filter(|s| *s == "[feature] solo: dev").count(), 1);
    assert!(repo
        .show_file(DELIVERY, "status.txt")
        .unwrap()
        .starts_with("fixed"));
    assert_eq!(
        workspace.delivery_head().await.unwrap(),
        repo.rev_parse(DELIVERY)
    );

    sandbox.shutdown().await;
}

#[tokio::test]
async fn test_repeated_validation_failure_abandons_agent_only() {
    let repo = TestRepo::new();
    let config = repo.config();
    let validator = Arc::new(ScriptedValidator::default().script("bad", &[false, false, false]));
    let agents = Arc::new(ScriptedAgent::new(|call| {
        let size = if call.agent.as_str() == "bad" { 40 } else { 5 };
        write(
            call,
            &format!("{}.txt", call.agent),
            &lines(&format!("{} {}", call.agent, call.attempt), size),
        );
        AgentResponse::success("done")
    }));
    let (_, executor) = executor(&repo, &config, &agents, validator.clone());
    let before = {
        let workspace = GitWorkspace::from_config(&repo.path, &config).unwrap();
        workspace.init_repo().await.unwrap();
        workspace.delivery_head().await.unwrap()
    };

    let report = executor.execute(&node(&["bad", "good"])).await.unwrap();

    match &report.outcomes[&agent("bad")] {
        AgentOutcome::Abandoned(AbandonReason::ValidationFailed { failures, .. }) => {
            assert_eq!(*failures, 3)
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(report.outcomes[&agent("good")].is_integrated());
    assert!(report.succeeded());

    assert!(repo.show_file(DELIVERY, "bad.txt").is_none());
    assert!(repo.show_file(DELIVERY, "good.txt").is_some());
    assert_eq!(repo.rev_parse(&format!("{}~1", DELIVERY)), before);

    let validated: Vec<String> = validator.calls().into_iter().map(String::from).collect();
    assert_eq!(validated, vec!["bad", "bad", "bad", "good"]);
}

#[tokio::test]
async fn test_agents_exchange_messages() {
    let repo = TestRepo::new();
    let config = repo.config();
    let agents = Arc::new(ScriptedAgent::new(|call| {
        write(call, &format!("{}.txt", call.agent), &lines(call.agent.as_str(), 3));
        if call.agent.as_str() == "api" {
            AgentResponse::success("done\n@ui: the endpoint is POST /login")
        } else {
            AgentResponse::success("done")
        }
    }));
    let (_, executor) = executor(&repo, &config, &agents, Arc::new(AlwaysPass));

    executor.execute(&node(&["api", "ui"])).await.unwrap();

    let ui = agents.calls_for("ui");
    assert!(ui[0].prompt.contains("api: the endpoint is POST /login"));
    assert!(ui[0].prompt.contains("coordinator: Build the feature"));
    assert!(!agents.calls_for("api")[0].prompt.contains("POST /login"));
}

#[tokio::test]
async fn test_worktrees_survive_node_until_removed() {
    let repo = TestRepo::new();
    let config = repo.config();
    let agents = Arc::new(ScriptedAgent::new(|call| {
        write(call, &format!("{}.txt", call.agent), "x\n");
        AgentResponse::success("done")
    }));
    let (workspace, executor) = executor(&repo, &config, &agents, Arc::new(AlwaysPass));

    executor.execute(&node(&["a", "b"])).await.unwrap();
    assert!(workspace.agent_path(&agent("a")).exists());
    assert!(repo.branch_exists(&GitWorkspace::agent_branch(&agent("a"))));

    workspace.remove_worktree(&agent("a")).await.unwrap();
    assert!(!workspace.agent_path(&agent("a")).exists());
    assert!(!repo.branch_exists(&GitWorkspace::agent_branch(&agent("a"))));
    assert!(workspace.agent_path(&agent("b")).exists());
}
