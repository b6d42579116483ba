//! Plans and the planning seam.
//!
//! A [`Plan`] is the declarative input of a round: the nodes to run, who runs
//! them and what they depend on. Plans are loaded from TOML or JSON files and
//! turned into a [`TaskGraph`] at the start of every round.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::AgentId;
use crate::core::{NodeId, NodeStatus, TaskGraph, TaskNode};
use crate::execution::engine::RoundReport;
use crate::{Error, Result};

/// One node as written in a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedNode {
    pub id: NodeId,
    pub role: String,
    #[serde(default)]
    pub description: String,
    /// None runs only `commands`, one is a single-agent node, more collaborate.
    #[serde(default)]
    pub agents: Vec<AgentId>,
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
    /// Shell commands run in the delivery worktree after the agent finishes.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PlannedNode {
    pub fn new(id: impl Into<NodeId>, role: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            role: role.to_string(),
            description: description.to_string(),
            agents: Vec::new(),
            depends_on: Vec::new(),
            commands: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn agents(mut self, agents: &[&str]) -> Result<Self> {
        self.agents = agents
            .iter()
            .map(|a| AgentId::new(*a))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    pub fn depends_on(mut self, id: impl Into<NodeId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn command(mut self, command: &str) -> Self {
        self.commands.push(command.to_string());
        self
    }

    pub fn to_node(&self) -> TaskNode {
        let mut node = TaskNode::new(self.id.clone(), &self.role, &self.description)
            .with_agents(self.agents.clone());
        for dep in &self.depends_on {
            node = node.depends_on(dep.clone());
        }
        node.metadata = self.metadata.clone();
        node
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub nodes: Vec<PlannedNode>,
}

impl Plan {
    pub fn new(goal: &str, nodes: Vec<PlannedNode>) -> Self {
        Self {
            goal: goal.to_string(),
            nodes,
        }
    }

    /// Load a plan; `.json` files are parsed as JSON, everything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Plan::load");
        let content = fs::read_to_string(path)?;
        let plan: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        info!(goal = %plan.goal, nodes = plan.nodes.len(), "Plan loaded");
        Ok(plan)
    }

    pub fn get(&self, id: &NodeId) -> Option<&PlannedNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Every agent named anywhere in the plan, sorted.
    pub fn agents(&self) -> Vec<AgentId> {
        let set: HashSet<&AgentId> = self.nodes.iter().flat_map(|n| &n.agents).collect();
        let mut agents: Vec<AgentId> = set.into_iter().cloned().collect();
        agents.sort();
        agents
    }
}

impl TaskGraph {
    /// Build the graph for a plan.
    ///
    /// # Errors
    /// `DuplicateNode`, `UnknownNode` or `CyclicGraph`.
    pub fn from_plan(plan: &Plan) -> Result<Self> {
        Self::build(plan.nodes.iter().map(PlannedNode::to_node))
    }
}

/// Produces the plan for each round.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str) -> Result<Plan>;

    /// Plan for the next round after `report`. None when nothing is left to
    /// try.
    async fn replan(&self, previous: &Plan, report: &RoundReport) -> Result<Option<Plan>>;
}

/// Serves a fixed plan and retries what did not complete.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    plan: Plan,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self { plan }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(Plan::load(path)?))
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, goal: &str) -> Result<Plan> {
        if self.plan.nodes.is_empty() {
            return Err(Error::InvalidPlan("plan has no nodes".to_string()));
        }
        let mut plan = self.plan.clone();
        if !goal.trim().is_empty() {
            plan.goal = goal.to_string();
        }
        Ok(plan)
    }

    /// Carry every node that did not complete into a fresh plan. Dependencies
    /// on completed nodes are dropped since their work is already on the
    /// delivery line.
    async fn replan(&self, previous: &Plan, report: &RoundReport) -> Result<Option<Plan>> {
        let completed: HashSet<&NodeId> = report
            .nodes
            .iter()
            .filter(|n| n.node.status == NodeStatus::Completed)
            .map(|n| &n.node.id)
            .collect();

        let nodes: Vec<PlannedNode> = previous
            .nodes
            .iter()
            .filter(|n| !completed.contains(&n.id))
            .map(|n| {
                let mut next = n.clone();
                next.depends_on.retain(|dep| !completed.contains(dep));
                next
            })
            .collect();

        if nodes.is_empty() {
            return Ok(None);
        }
        info!(
            round = report.round + 1,
            carried = nodes.len(),
            dropped = completed.len(),
            "Replanned"
        );
        Ok(Some(Plan::new(&previous.goal, nodes)))
    }
}
