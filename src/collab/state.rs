//! Merge-attempt bookkeeping and per-agent outcomes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::collab::stats::AgentPrStats;
use crate::core::NodeId;

/// Retry counters for one agent while its change is being integrated.
///
/// Lives only for the duration of that agent's integration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationState {
    pub agent: AgentId,
    /// Fix attempts issued after a failed validation.
    pub validation_retries: u32,
    /// Re-implementation attempts issued after a conflict.
    pub conflict_retries: u32,
    /// Delivery head before this agent's change was applied.
    pub last_good: Option<String>,
    pub conflict_files: Vec<String>,
}

impl CollaborationState {
    pub fn new(agent: AgentId) -> Self {
        Self {
            agent,
            validation_retries: 0,
            conflict_retries: 0,
            last_good: None,
            conflict_files: Vec::new(),
        }
    }

    /// 1 for the first dispatch, plus one per retry of either kind.
    pub fn attempt(&self) -> u32 {
        1 + self.validation_retries + self.conflict_retries
    }
}

/// Why an agent's change was given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AbandonReason {
    /// Still conflicting after the configured number of re-implementations.
    ConflictCeiling { conflicts: u32, files: Vec<String> },
    /// Validation kept failing after every allowed fix.
    ValidationFailed { failures: u32, report: String },
}

/// What happened to one agent's contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AgentOutcome {
    /// On the delivery line and validated.
    Integrated { commit: String, attempts: u32 },
    /// Nothing to apply.
    NoChanges,
    /// The agent invocation itself failed.
    AgentFailed { reason: String },
    Abandoned(AbandonReason),
}

impl AgentOutcome {
    pub fn is_integrated(&self) -> bool {
        matches!(self, AgentOutcome::Integrated { .. })
    }
}

/// Result of running one collaborative node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationReport {
    pub node: NodeId,
    pub merge_order: Vec<AgentPrStats>,
    pub outcomes: BTreeMap<AgentId, AgentOutcome>,
}

impl CollaborationReport {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            merge_order: Vec::new(),
            outcomes: BTreeMap::new(),
        }
    }

    /// True when at least one agent's change was integrated.
    pub fn succeeded(&self) -> bool {
        self.outcomes.values().any(AgentOutcome::is_integrated)
    }

    pub fn integrated(&self) -> Vec<&AgentId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_integrated())
            .map(|(agent, _)| agent)
            .collect()
    }

    /// One line per agent, used as a node failure reason.
    pub fn summary(&self) -> String {
        self.outcomes
            .iter()
            .map(|(agent, outcome)| {
                let what = match outcome {
                    AgentOutcome::Integrated { attempts, .. } => {
                        format!("integrated after {} attempt(s)", attempts)
                    }
                    AgentOutcome::NoChanges => "no changes".to_string(),
                    AgentOutcome::AgentFailed { reason } => format!("agent failed: {}", reason),
                    AgentOutcome::Abandoned(AbandonReason::ConflictCeiling { conflicts, .. }) => {
                        format!("abandoned after {} conflicts", conflicts)
                    }
                    AgentOutcome::Abandoned(AbandonReason::ValidationFailed { failures, .. }) => {
                        format!("abandoned after {} failed validations", failures)
                    }
                };
                format!("{}: {}", agent, what)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
