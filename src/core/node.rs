//! Task node data model for the execution graph.
//!
//! A node is one unit of planned work, assigned to a single agent or to a
//! group of agents that collaborate on it. Nodes are owned by the
//! [`TaskGraph`](super::TaskGraph); all status changes go through it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// Unique, human-chosen identifier of a node within a plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node status in its lifecycle.
///
/// Pending → Ready → Running → {Completed, Failed}. A Pending node may also
/// go straight to Failed when one of its dependencies failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum NodeStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed {
        reason: String,
    },
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed { .. })
    }

    /// Status name without the failure reason.
    pub fn name(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Failed { reason } => write!(f, "failed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Who works on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "agents")]
pub enum Assignment {
    /// No agent; only declared commands run.
    #[default]
    Unassigned,
    Single(AgentId),
    Collaborative(Vec<AgentId>),
}

impl Assignment {
    /// Build an assignment from a list of agents. One agent is `Single`.
    pub fn from_agents(mut agents: Vec<AgentId>) -> Self {
        let mut seen = std::collections::HashSet::new();
        agents.retain(|agent| seen.insert(agent.clone()));
        match agents.len() {
            0 => Assignment::Unassigned,
            1 => Assignment::Single(agents.remove(0)),
            _ => Assignment::Collaborative(agents),
        }
    }

    pub fn agents(&self) -> Vec<&AgentId> {
        match self {
            Assignment::Unassigned => Vec::new(),
            Assignment::Single(agent) => vec![agent],
            Assignment::Collaborative(agents) => agents.iter().collect(),
        }
    }

    pub fn is_collaborative(&self) -> bool {
        matches!(self, Assignment::Collaborative(_))
    }
}

/// A single node in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: NodeId,
    /// Role or requirement descriptor. Opaque to the scheduler.
    pub role: String,
    /// Task text handed to the assigned agents.
    pub description: String,
    pub assignment: Assignment,
    pub status: NodeStatus,
    /// Ids of nodes that must complete first, in declaration order.
    pub depends_on: Vec<NodeId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    pub fn new(id: impl Into<NodeId>, role: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            role: role.to_string(),
            description: description.to_string(),
            assignment: Assignment::Unassigned,
            status: NodeStatus::Pending,
            depends_on: Vec::new(),
            metadata: BTreeMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_agent(mut self, agent: AgentId) -> Self {
        self.assignment = Assignment::Single(agent);
        self
    }

    pub fn with_agents(mut self, agents: Vec<AgentId>) -> Self {
        self.assignment = Assignment::from_agents(agents);
        self
    }

    pub fn depends_on(mut self, id: impl Into<NodeId>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn mark_ready(&mut self) {
        self.status = NodeStatus::Ready;
    }

    pub(crate) fn start(&mut self) {
        self.status = NodeStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self) {
        self.status = NodeStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, reason: &str) {
        self.status = NodeStatus::Failed {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }
}
