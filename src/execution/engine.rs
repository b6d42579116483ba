//! Multi-round execution of a plan.
//!
//! Each round builds a fresh [`TaskGraph`] from the current plan and drives it
//! to completion one ready node at a time. Collaborative nodes go through the
//! [`CollaborativeExecutor`]; single-agent nodes work directly on the delivery
//! line and have their commands run by the [`SandboxTaskExecutor`]. A round
//! is accepted when enough of its nodes complete; otherwise the planner gets
//! a chance to produce the next round.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentContext, AgentId, AgentInvoker, CommandAgent};
use crate::collab::{CollaborationReport, CollaborativeExecutor, GitWorkspace, Workspace};
use crate::config::{Config, ExecutionConfig};
use crate::core::{Assignment, NodeCounts, NodeId, NodeStatus, TaskGraph, TaskNode};
use crate::execution::plan::{Plan, PlannedNode, Planner};
use crate::prompt;
use crate::sandbox::{SandboxTask, SandboxTaskExecutor, SubmitOptions};
use crate::util::tail;
use crate::validation::{CommandValidator, Validator};
use crate::{Error, Result};

/// Agent output kept in a failure reason.
const REASON_TAIL: usize = 500;
/// Extra time allowed on top of the command timeouts when waiting for a chain.
const WAIT_GRACE: Duration = Duration::from_secs(5);

/// What happened to one node in a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Final snapshot, including status and failure reason.
    pub node: TaskNode,
    pub agent_output: Option<String>,
    #[serde(default)]
    pub commands: Vec<SandboxTask>,
    pub collaboration: Option<CollaborationReport>,
}

impl NodeReport {
    pub fn new(node: TaskNode) -> Self {
        Self {
            node,
            agent_output: None,
            commands: Vec::new(),
            collaboration: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub round: u32,
    pub nodes: Vec<NodeReport>,
    pub counts: NodeCounts,
    /// Completed nodes over all nodes. 1.0 for an empty round.
    pub acceptance: f64,
    pub accepted: bool,
}

impl RoundReport {
    pub fn new(round: u32, nodes: Vec<NodeReport>, threshold: f64) -> Self {
        let mut counts = NodeCounts::default();
        for report in &nodes {
            match report.node.status {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Ready => counts.ready += 1,
                NodeStatus::Running => counts.running += 1,
                NodeStatus::Completed => counts.completed += 1,
                NodeStatus::Failed { .. } => counts.failed += 1,
            }
        }
        let acceptance = if counts.total() == 0 {
            1.0
        } else {
            counts.completed as f64 / counts.total() as f64
        };
        Self {
            round,
            nodes,
            counts,
            acceptance,
            accepted: acceptance >= threshold,
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.node.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub goal: String,
    pub rounds: Vec<RoundReport>,
    pub accepted: bool,
    /// Delivery line head after the last round.
    pub delivery_head: Option<String>,
}

/// Drives plans round by round until accepted or out of rounds.
pub struct ExecutionLoop {
    workspace: Arc<dyn Workspace>,
    invoker: Arc<dyn AgentInvoker>,
    sandbox: Arc<SandboxTaskExecutor>,
    planner: Arc<dyn Planner>,
    collaborative: CollaborativeExecutor,
    execution: ExecutionConfig,
    command_timeout: Duration,
}

impl ExecutionLoop {
    pub fn new(
        workspace: Arc<dyn Workspace>,
        invoker: Arc<dyn AgentInvoker>,
        validator: Arc<dyn Validator>,
        sandbox: Arc<SandboxTaskExecutor>,
        planner: Arc<dyn Planner>,
        config: &Config,
    ) -> Self {
        let collaborative = CollaborativeExecutor::new(
            workspace.clone(),
            invoker.clone(),
            validator,
            config.collaboration.clone(),
        );
        Self {
            workspace,
            invoker,
            sandbox,
            planner,
            collaborative,
            execution: config.execution.clone(),
            command_timeout: config.sandbox.default_timeout(),
        }
    }

    /// Wire the git workspace, command agent, local sandbox and configured
    /// validator for `repo`.
    pub fn from_config(repo: &Path, planner: Arc<dyn Planner>, config: &Config) -> Result<Self> {
        let workspace = Arc::new(GitWorkspace::from_config(repo, config)?);
        let sandbox = Arc::new(SandboxTaskExecutor::local(&config.sandbox)?);
        let validator = CommandValidator::from_config(sandbox.clone(), &config.validation);
        let invoker = Arc::new(CommandAgent::from_config(&config.agent));
        Ok(Self::new(workspace, invoker, validator, sandbox, planner, config))
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.execution.max_rounds = max_rounds;
        self
    }

    pub fn sandbox(&self) -> &Arc<SandboxTaskExecutor> {
        &self.sandbox
    }

    /// Plan for `goal` and run rounds until one is accepted, `max_rounds` is
    /// reached or the planner has nothing left.
    ///
    /// # Errors
    /// Planning errors and graph construction errors (`CyclicGraph`,
    /// `DuplicateNode`, `UnknownNode`). Failures while running nodes are
    /// recorded in the report instead.
    pub async fn run(&self, goal: &str) -> Result<ExecutionReport> {
        let mut plan = self.planner.plan(goal).await?;
        let max_rounds = self.execution.max_rounds.max(1);
        info!(goal = %plan.goal, nodes = plan.nodes.len(), max_rounds, "Execution started");

        let mut rounds: Vec<RoundReport> = Vec::new();
        for round in 1..=max_rounds {
            let report = self.run_round(round, &plan).await?;
            let accepted = report.accepted;
            rounds.push(report);
            if accepted || round == max_rounds {
                break;
            }

            let Some(last) = rounds.last() else { break };
            let next = self.planner.replan(&plan, last).await?;
            match next {
                Some(next) => plan = next,
                None => {
                    info!(round, "Nothing left to replan");
                    break;
                }
            }
        }

        let accepted = rounds.last().is_some_and(|r| r.accepted);
        let delivery_head = match self.workspace.delivery_head().await {
            Ok(head) => Some(head),
            Err(e) => {
                debug!(error = %e, "No delivery head");
                None
            }
        };
        info!(rounds = rounds.len(), accepted, "Execution finished");
        Ok(ExecutionReport {
            goal: plan.goal,
            rounds,
            accepted,
            delivery_head,
        })
    }

    /// Run every node of `plan` once.
    pub async fn run_round(&self, round: u32, plan: &Plan) -> Result<RoundReport> {
        let mut graph = TaskGraph::from_plan(plan)?;
        info!(round, nodes = graph.len(), "Round started");
        self.workspace.init_repo().await?;

        let mut reports: Vec<NodeReport> = Vec::with_capacity(graph.len());
        loop {
            let ready = graph.ready_nodes();
            if ready.is_empty() {
                let blocked = graph.fail_blocked()?;
                if !blocked.is_empty() {
                    warn!(round, blocked = ?blocked, "Nodes blocked by failed dependencies");
                }
                break;
            }

            for id in ready {
                graph.mark_running(&id)?;
                let node = graph.get(&id).cloned().ok_or_else(|| Error::UnknownNode(id.clone()))?;
                let planned = plan.get(&id).ok_or_else(|| Error::UnknownNode(id.clone()))?;

                let mut report = NodeReport::new(node.clone());
                let failure = match self.run_node(&node, planned, &mut report).await {
                    Ok(failure) => failure,
                    Err(e) => {
                        error!(node = %id, error = %e, "Node execution error");
                        Some(e.to_string())
                    }
                };
                match failure {
                    None => graph.mark_completed(&id)?,
                    Some(reason) => {
                        warn!(node = %id, %reason, "Node failed");
                        graph.mark_failed(&id, &reason)?;
                    }
                }
                reports.push(report);
            }
        }

        // Snapshots taken at dispatch are refreshed with the final status.
        let mut final_reports = Vec::with_capacity(graph.len());
        for node in graph.summary() {
            let mut report = match reports.iter().position(|r| r.node.id == node.id) {
                Some(index) => reports.swap_remove(index),
                None => NodeReport::new(node.clone()),
            };
            report.node = node;
            final_reports.push(report);
        }

        for agent in plan.agents() {
            if let Err(e) = self.workspace.remove_worktree(&agent).await {
                warn!(%agent, error = %e, "Failed to remove agent worktree");
            }
        }

        let report = RoundReport::new(round, final_reports, self.execution.acceptance_threshold);
        info!(
            round,
            completed = report.counts.completed,
            failed = report.counts.failed,
            acceptance = report.acceptance,
            accepted = report.accepted,
            "Round finished"
        );
        Ok(report)
    }

    /// Run one node. Ok(Some(reason)) is an ordinary failure.
    async fn run_node(
        &self,
        node: &TaskNode,
        planned: &PlannedNode,
        report: &mut NodeReport,
    ) -> Result<Option<String>> {
        info!(node = %node.id, role = %node.role, "Node started");
        match &node.assignment {
            Assignment::Collaborative(_) => {
                let collaboration = self.collaborative.execute(node).await?;
                let succeeded = collaboration.succeeded();
                let summary = collaboration.summary();
                report.collaboration = Some(collaboration);
                if !succeeded {
                    return Ok(Some(format!("no change integrated ({})", summary)));
                }
                let path = self.workspace.delivery_path();
                self.run_commands(node, &planned.commands, &path, report).await
            }
            Assignment::Single(agent) => self.run_single(node, agent, planned, report).await,
            Assignment::Unassigned => {
                let path = self.workspace.delivery_path();
                self.run_commands(node, &planned.commands, &path, report).await
            }
        }
    }

    /// The agent works on the delivery line directly. Its work is committed
    /// only when the agent and every command succeed; otherwise the delivery
    /// line is reset.
    async fn run_single(
        &self,
        node: &TaskNode,
        agent: &AgentId,
        planned: &PlannedNode,
        report: &mut NodeReport,
    ) -> Result<Option<String>> {
        let head = self.workspace.delivery_head().await?;
        let path = self.workspace.delivery_path();
        let prompt = prompt::single(node, &planned.commands);
        let context = AgentContext::new(node.id.clone(), &path);

        let response = self.invoker.invoke(agent, &prompt, &context).await?;
        report.agent_output = Some(response.content.clone());
        if !response.success {
            self.workspace.reset_delivery_to(&head).await?;
            return Ok(Some(format!(
                "agent {} failed: {}",
                agent,
                tail(response.content.trim(), REASON_TAIL)
            )));
        }

        let mut commands = prompt::shell_commands(&response.content);
        for command in &planned.commands {
            if !commands.contains(command) {
                commands.push(command.clone());
            }
        }
        if let Some(reason) = self.run_commands(node, &commands, &path, report).await? {
            self.workspace.reset_delivery_to(&head).await?;
            return Ok(Some(reason));
        }

        let message = CollaborativeExecutor::commit_message(node, agent);
        match self.workspace.commit_delivery(&message).await? {
            Some(commit) => info!(node = %node.id, %agent, %commit, "Node committed"),
            None => debug!(node = %node.id, %agent, "Node left no changes"),
        }
        Ok(None)
    }

    /// Run `commands` in order in `dir`, stopping at the first failure.
    async fn run_commands(
        &self,
        node: &TaskNode,
        commands: &[String],
        dir: &Path,
        report: &mut NodeReport,
    ) -> Result<Option<String>> {
        if commands.is_empty() {
            return Ok(None);
        }
        debug!(node = %node.id, count = commands.len(), "Submitting node commands");

        let options = SubmitOptions::new()
            .working_dir(dir)
            .env("WEAVE_NODE_ID", node.id.as_str());
        let ids = self.sandbox.submit_chain(commands, true, options).await?;
        let count = u32::try_from(ids.len()).unwrap_or(u32::MAX);
        let wait = self.command_timeout.saturating_mul(count) + WAIT_GRACE;
        let tasks = self.sandbox.wait_all(&ids, wait).await?;

        let failure = tasks.iter().find(|task| !task.is_success()).map(|task| {
            let why = match &task.error {
                Some(error) => error.to_string(),
                None => task.status.to_string(),
            };
            format!("`{}`: {}", task.command, why)
        });
        report.commands = tasks;
        Ok(failure)
    }
}
