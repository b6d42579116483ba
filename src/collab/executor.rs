//! Multi-agent execution of one task node.
//!
//! Every agent implements the node in its own worktree. Their changes are
//! then applied to the delivery line one at a time, largest first. A change
//! that conflicts is re-implemented on top of the current delivery state; a
//! change that fails validation is rolled back and handed back to its agent
//! together with the validator's report.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agent::{AgentContext, AgentId, AgentInvoker};
use crate::collab::channel::{AgentInbox, RoundChannel};
use crate::collab::state::{AbandonReason, AgentOutcome, CollaborationReport, CollaborationState};
use crate::collab::stats::merge_order;
use crate::collab::workspace::{CherryPick, Workspace};
use crate::config::CollaborationConfig;
use crate::core::TaskNode;
use crate::prompt;
use crate::util::tail;
use crate::validation::Validator;
use crate::{Error, Result};

/// Agent output kept in a failure reason.
const REASON_TAIL: usize = 500;

struct Participant {
    agent: AgentId,
    worktree: PathBuf,
    inbox: AgentInbox,
}

/// Orchestrates several agents against one node.
pub struct CollaborativeExecutor {
    workspace: Arc<dyn Workspace>,
    invoker: Arc<dyn AgentInvoker>,
    validator: Arc<dyn Validator>,
    config: CollaborationConfig,
}

impl CollaborativeExecutor {
    pub fn new(
        workspace: Arc<dyn Workspace>,
        invoker: Arc<dyn AgentInvoker>,
        validator: Arc<dyn Validator>,
        config: CollaborationConfig,
    ) -> Self {
        Self {
            workspace,
            invoker,
            validator,
            config,
        }
    }

    /// Commit message for an agent's work on a node.
    pub fn commit_message(node: &TaskNode, agent: &AgentId) -> String {
        format!("[{}] {}: {}", node.id, agent, node.role)
    }

    /// Run every assigned agent and integrate their changes.
    ///
    /// Worktrees are left in place; the caller removes them when the round
    /// ends.
    ///
    /// # Errors
    /// Workspace and validator errors abort the node. Agent failures,
    /// conflicts and failed validations are recorded in the report.
    pub async fn execute(&self, node: &TaskNode) -> Result<CollaborationReport> {
        let agents: Vec<AgentId> = node.assignment.agents().into_iter().cloned().collect();
        if agents.is_empty() {
            return Err(Error::InvalidPlan(format!("node {} has no agents", node.id)));
        }
        info!(node = %node.id, agents = agents.len(), "Collaborative execution started");

        self.workspace.init_repo().await?;
        let channel = RoundChannel::new(self.config.channel_capacity);
        let mut participants = Vec::with_capacity(agents.len());
        for agent in &agents {
            let worktree = self.workspace.create_worktree(agent).await?;
            participants.push(Participant {
                agent: agent.clone(),
                worktree,
                inbox: channel.subscribe(agent),
            });
        }
        channel.broadcast(&node.description);

        let mut report = CollaborationReport::new(node.id.clone());
        let mut contributors = Vec::new();
        for participant in participants.iter_mut() {
            let peers: Vec<AgentId> = agents
                .iter()
                .filter(|a| **a != participant.agent)
                .cloned()
                .collect();
            let prompt = prompt::implementation(
                node,
                &participant.agent,
                &peers,
                &participant.inbox.drain(),
            );
            let context = AgentContext::new(node.id.clone(), &participant.worktree);

            match self.dispatch(&participant.agent, &prompt, &context, &channel).await {
                Ok(()) => {
                    self.workspace
                        .commit(&participant.agent, &Self::commit_message(node, &participant.agent))
                        .await?;
                    contributors.push(participant.agent.clone());
                }
                Err(reason) => {
                    warn!(node = %node.id, agent = %participant.agent, %reason, "Agent failed");
                    report
                        .outcomes
                        .insert(participant.agent.clone(), AgentOutcome::AgentFailed { reason });
                }
            }
        }

        let mut stats = Vec::with_capacity(contributors.len());
        for agent in &contributors {
            stats.push(self.workspace.stats(agent).await?);
        }
        report.merge_order = merge_order(stats);
        let order: Vec<(&str, usize)> = report
            .merge_order
            .iter()
            .map(|s| (s.agent.as_str(), s.total_changes()))
            .collect();
        debug!(node = %node.id, ?order, "Merge order");

        for stats in &report.merge_order {
            let Some(participant) = participants.iter_mut().find(|p| p.agent == stats.agent) else {
                continue;
            };
            let outcome = self.integrate(node, participant, &channel).await?;
            info!(node = %node.id, agent = %participant.agent, ?outcome, "Agent integration finished");
            report.outcomes.insert(participant.agent.clone(), outcome);
        }

        info!(
            node = %node.id,
            integrated = report.integrated().len(),
            succeeded = report.succeeded(),
            "Collaborative execution finished"
        );
        Ok(report)
    }

    /// Apply one agent's change, retrying on conflicts and failed
    /// validation until it lands or is abandoned.
    async fn integrate(
        &self,
        node: &TaskNode,
        participant: &mut Participant,
        channel: &RoundChannel,
    ) -> Result<AgentOutcome> {
        let agent = participant.agent.clone();
        let mut state = CollaborationState::new(agent.clone());

        loop {
            let last_good = self.workspace.delivery_head().await?;
            state.last_good = Some(last_good.clone());

            let prompt = match self.workspace.cherry_pick(&agent).await? {
                CherryPick::Empty => return Ok(AgentOutcome::NoChanges),
                CherryPick::Conflict { files } => {
                    if state.conflict_retries >= self.config.max_conflict_retries {
                        warn!(node = %node.id, %agent, conflicts = state.conflict_retries + 1, "Conflict ceiling reached");
                        return Ok(AgentOutcome::Abandoned(AbandonReason::ConflictCeiling {
                            conflicts: state.conflict_retries + 1,
                            files,
                        }));
                    }
                    state.conflict_retries += 1;
                    state.conflict_files = files;
                    info!(node = %node.id, %agent, files = ?state.conflict_files, "Conflict, re-implementing on delivery state");

                    self.workspace.sync_worktree_to_delivery(&agent).await?;
                    prompt::reimplement(node, &agent, &state.conflict_files, &participant.inbox.drain())
                }
                CherryPick::Applied { commit } => {
                    let validation = self
                        .validator
                        .validate(node, &agent, &self.workspace.delivery_path())
                        .await?;
                    if validation.passed {
                        return Ok(AgentOutcome::Integrated {
                            commit,
                            attempts: state.attempt(),
                        });
                    }

                    self.workspace.reset_delivery_to(&last_good).await?;
                    if state.validation_retries >= self.config.max_validation_retries {
                        warn!(node = %node.id, %agent, failures = state.validation_retries + 1, "Validation kept failing");
                        return Ok(AgentOutcome::Abandoned(AbandonReason::ValidationFailed {
                            failures: state.validation_retries + 1,
                            report: validation.report,
                        }));
                    }
                    state.validation_retries += 1;
                    info!(node = %node.id, %agent, retry = state.validation_retries, "Validation failed, requesting fix");

                    if self.config.resync_on_validation_failure {
                        self.workspace.sync_worktree_to_delivery(&agent).await?;
                    }
                    prompt::fix(node, &agent, &validation.report, &participant.inbox.drain())
                }
            };

            let context = AgentContext::new(node.id.clone(), &participant.worktree)
                .with_attempt(state.attempt());
            if let Err(reason) = self.dispatch(&agent, &prompt, &context, channel).await {
                return Ok(AgentOutcome::AgentFailed { reason });
            }
            self.workspace
                .commit(&agent, &Self::commit_message(node, &agent))
                .await?;
        }
    }

    /// Invoke an agent and publish its mentions. Err carries the failure
    /// reason.
    async fn dispatch(
        &self,
        agent: &AgentId,
        prompt: &str,
        context: &AgentContext,
        channel: &RoundChannel,
    ) -> std::result::Result<(), String> {
        debug!(%agent, node = %context.node, attempt = context.attempt, "Dispatching agent");
        match self.invoker.invoke(agent, prompt, context).await {
            Ok(response) if response.success => {
                channel.publish_mentions(agent, &response.content);
                Ok(())
            }
            Ok(response) => Err(tail(response.content.trim(), REASON_TAIL).to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}
