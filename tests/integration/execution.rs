//! Multi-round plan execution end to end, with scripted agents.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use weave::agent::AgentResponse;
use weave::collab::GitWorkspace;
use weave::config::Config;
use weave::core::NodeStatus;
use weave::execution::{ExecutionLoop, Plan, PlannedNode, StaticPlanner};
use weave::sandbox::{SandboxStatus, SandboxTaskExecutor};
use weave::validation::AlwaysPass;
use weave::Error;

use crate::fixtures::{lines, write, ScriptedAgent, TestRepo};

const DELIVERY: &str = "weave/delivery";

fn engine(repo: &TestRepo, config: &Config, agents: &Arc<ScriptedAgent>, plan: Plan) -> ExecutionLoop {
    let workspace = Arc::new(GitWorkspace::from_config(&repo.path, config).unwrap());
    let sandbox = Arc::new(SandboxTaskExecutor::local(&config.sandbox).unwrap());
    ExecutionLoop::new(
        workspace,
        agents.clone(),
        Arc::new(AlwaysPass),
        sandbox,
        Arc::new(StaticPlanner::new(plan)),
        config,
    )
}

fn feature_plan() -> Plan {
    Plan::new(
        "login",
        vec![
            PlannedNode::new("setup", "scaffold", "Create the project skeleton")
                .agents(&["lead"])
                .unwrap(),
            PlannedNode::new("feature", "dev", "Implement login")
                .agents(&["api", "ui"])
                .unwrap()
                .depends_on("setup"),
            PlannedNode::new("verify", "ci", "")
                .depends_on("feature")
                .command("test -f setup.txt && test -f api.txt && test -f ui.txt"),
        ],
    )
}

#[tokio::test]
async fn test_plan_runs_to_acceptance_in_one_round() {
    let repo = TestRepo::new();
    let config = repo.config();
    let agents = Arc::new(ScriptedAgent::new(|call| match call.agent.as_str() {
        "lead" => {
            write(call, "setup.txt", "skeleton\n");
            AgentResponse::success("Created the skeleton.\n\n```sh\ntest -f setup.txt\n```")
        }
        other => {
            write(call, &format!("{}.txt", other), &lines(other, 4));
            AgentResponse::success("done")
        }
    }));
    let engine = engine(&repo, &config, &agents, feature_plan());

    let report = engine.run("").await.unwrap();

    assert!(report.accepted);
    assert_eq!(report.goal, "login");
    assert_eq!(report.rounds.len(), 1);
    let round = &report.rounds[0];
    assert_eq!(round.counts.completed, 3);
    assert_eq!(round.acceptance, 1.0);

    let setup = round.node(&"setup".into()).unwrap();
    assert_eq!(setup.commands.len(), 1);
    assert_eq!(setup.commands[0].status, SandboxStatus::Success);
    assert!(setup.agent_output.as_deref().unwrap().contains("skeleton"));

    let feature = round.node(&"feature".into()).unwrap();
    assert_eq!(feature.collaboration.as_ref().unwrap().integrated().len(), 2);
    let verify = round.node(&"verify".into()).unwrap();
    assert_eq!(verify.commands[0].status, SandboxStatus::Success);

    // Nodes ran in dependency order and their work is on the delivery line.
    let order: Vec<String> = agents.calls().into_iter().map(|c| c.node).collect();
    assert_eq!(order, vec!["setup", "feature", "feature"]);
    assert!(repo
        .log_subjects(DELIVERY)
        .contains(&"[setup] lead: scaffold".to_string()));
    assert_eq!(report.delivery_head.as_deref(), Some(repo.rev_parse(DELIVERY).as_str()));

    // Agent worktrees are removed at the end of the round.
    assert!(!repo.branch_exists("weave/agent/api"));
    assert!(!repo.branch_exists("weave/agent/ui"));

    engine.sandbox().shutdown().await;
}

#[tokio::test]
async fn test_failed_node_blocks_dependents_and_is_replanned() {
    let repo = TestRepo::new();
    let config = repo.config();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let agents = Arc::new(ScriptedAgent::new(move |call| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return AgentResponse::failure("rate limited");
        }
        write(call, "flaky.txt", "ok\n");
        AgentResponse::success("done")
    }));
    let plan = Plan::new(
        "retry",
        vec![
            PlannedNode::new("independent", "ci", "").command("true"),
            PlannedNode::new("flaky", "dev", "Do the thing")
                .agents(&["dev"])
                .unwrap(),
            PlannedNode::new("after", "ci", "")
                .depends_on("flaky")
                .command("test -f flaky.txt"),
        ],
    );
    let engine = engine(&repo, &config, &agents, plan);

    let report = engine.run("").await.unwrap();

    assert!(report.accepted);
    assert_eq!(report.rounds.len(), 2);

    let first = &report.rounds[0];
    assert!(!first.accepted);
    assert_eq!(first.counts.completed, 1);
    assert_eq!(first.counts.failed, 2);
    match &first.node(&"flaky".into()).unwrap().node.status {
        NodeStatus::Failed { reason } => assert!(reason.contains("rate limited")),
        other => panic!("unexpected status: {:?}", other),
    }
    assert_eq!(
        first.node(&"after".into()).unwrap().node.status,
        NodeStatus::Failed {
            reason: "dependency failed: flaky".to_string()
        }
    );
    assert!(first.node(&"after".into()).unwrap().commands.is_empty());

    // Only unfinished nodes are carried into the second round.
    let second = &report.rounds[1];
    let ids: Vec<&str> = second.nodes.iter().map(|n| n.node.id.as_str()).collect();
    assert_eq!(ids, vec!["flaky", "after"]);
    assert_eq!(second.counts.completed, 2);

    engine.sandbox().shutdown().await;
}

#[tokio::test]
async fn test_failing_command_rolls_back_single_agent_work() {
    let repo = TestRepo::new();
    let mut config = repo.config();
    config.execution.max_rounds = 1;
    let agents = Arc::new(ScriptedAgent::new(|call| {
        write(call, "half-done.txt", "oops\n");
        AgentResponse::success("```sh\nfalse\n```")
    }));
    let plan = Plan::new(
        "broken",
        vec![PlannedNode::new("broken", "dev", "Break things")
            .agents(&["dev"])
            .unwrap()
            .command("echo unreachable")],
    );
    let engine = engine(&repo, &config, &agents, plan);
    let workspace = GitWorkspace::from_config(&repo.path, &config).unwrap();
    let before = {
        use weave::collab::Workspace;
        workspace.init_repo().await.unwrap();
        workspace.delivery_head().await.unwrap()
    };

    let report = engine.run("").await.unwrap();

    assert!(!report.accepted);
    assert_eq!(report.rounds.len(), 1);
    let node = report.rounds[0].node(&"broken".into()).unwrap();
    assert!(matches!(node.node.status, NodeStatus::Failed { .. }));
    assert_eq!(node.commands.len(), 2);
    assert_eq!(node.commands[0].status, SandboxStatus::Failed);
    assert!(node.commands[1].started_at.is_none());

    assert_eq!(repo.rev_parse(DELIVERY), before);
    assert!(repo.show_file(DELIVERY, "half-done.txt").is_none());

    engine.sandbox().shutdown().await;
}

#[tokio::test]
async fn test_cyclic_plan_fails_before_anything_runs() {
    let repo = TestRepo::new();
    let config = repo.config();
    let agents = Arc::new(ScriptedAgent::new(|_| AgentResponse::success("done")));
    let plan = Plan::new(
        "cycle",
        vec![
            PlannedNode::new("a", "r", "").agents(&["x"]).unwrap().depends_on("b"),
            PlannedNode::new("b", "r", "").agents(&["y"]).unwrap().depends_on("a"),
        ],
    );
    let engine = engine(&repo, &config, &agents, plan);

    let result = engine.run("").await;

    assert!(matches!(result, Err(Error::CyclicGraph { .. })));
    assert!(agents.calls().is_empty());

    engine.sandbox().shutdown().await;
}

#[tokio::test]
async fn test_acceptance_threshold_allows_partial_rounds() {
    let repo = TestRepo::new();
    let mut config = repo.config();
    config.execution.acceptance_threshold = 0.5;
    let agents = Arc::new(ScriptedAgent::new(|_| AgentResponse::success("done")));
    let plan = Plan::new(
        "partial",
        vec![
            PlannedNode::new("ok", "ci", "").command("true"),
            PlannedNode::new("bad", "ci", "").command("exit 1"),
        ],
    );
    let engine = engine(&repo, &config, &agents, plan);

    let report = engine.run("").await.unwrap();

    assert!(report.accepted);
    assert_eq!(report.rounds.len(), 1);
    assert_eq!(report.rounds[0].acceptance, 0.5);

    engine.sandbox().shutdown().await;
}
