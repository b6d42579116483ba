//! Task graph (DAG) for dependency-ordered scheduling.
//!
//! `TaskGraph` owns every [`TaskNode`] of a round and is the single writer of
//! their status. Nodes are stored in a petgraph `DiGraph` whose edges point
//! from a dependency to its dependent; node indices follow insertion order,
//! which is what makes ordering and readiness queries deterministic.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;

use crate::core::node::{NodeId, NodeStatus, TaskNode};
use crate::error::{Error, Result};

/// Per-status node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl NodeCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.completed + self.failed
    }
}

/// The task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build a graph from nodes that may reference each other in any order.
    ///
    /// Dependencies are wired after every node is present, then the graph is
    /// ordered once so that a cycle fails construction before anything runs.
    ///
    /// # Errors
    /// `DuplicateNode`, `UnknownNode` for a dependency on a missing node, or
    /// `CyclicGraph`.
    pub fn build(nodes: impl IntoIterator<Item = TaskNode>) -> Result<Self> {
        let mut graph = Self::new();
        let mut edges = Vec::new();

        for mut node in nodes {
            let deps = std::mem::take(&mut node.depends_on);
            edges.extend(deps.into_iter().map(|dep| (node.id.clone(), dep)));
            graph.add_node(node)?;
        }

        for (node, dep) in edges {
            graph.add_dependency(&node, &dep)?;
        }

        graph.topological_order()?;
        Ok(graph)
    }

    /// Add a node.
    ///
    /// Dependencies already listed on the node must refer to nodes that are
    /// in the graph.
    pub fn add_node(&mut self, node: TaskNode) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(Error::DuplicateNode(node.id));
        }
        if node.depends_on.contains(&node.id) {
            return Err(Error::CyclicGraph {
                unordered: vec![node.id],
            });
        }
        let dep_indices = node
            .depends_on
            .iter()
            .map(|dep| {
                self.index
                    .get(dep)
                    .copied()
                    .ok_or_else(|| Error::UnknownNode(dep.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let id = node.id.clone();
        let index = self.graph.add_node(node);
        for dep in dep_indices {
            self.graph.update_edge(dep, index, ());
        }
        self.index.insert(id, index);
        Ok(())
    }

    /// Record that `node` must wait for `depends_on`.
    ///
    /// Adding an existing dependency again is a no-op. Cycles spanning more
    /// than one node are reported by [`topological_order`](Self::topological_order).
    pub fn add_dependency(&mut self, node: &NodeId, depends_on: &NodeId) -> Result<()> {
        let node_index = self.node_index(node)?;
        let dep_index = self.node_index(depends_on)?;

        if node_index == dep_index {
            return Err(Error::CyclicGraph {
                unordered: vec![node.clone()],
            });
        }
        if self.graph.find_edge(dep_index, node_index).is_some() {
            return Ok(());
        }

        self.graph.add_edge(dep_index, node_index, ());
        let weight = &mut self.graph[node_index];
        if !weight.depends_on.contains(depends_on) {
            weight.depends_on.push(depends_on.clone());
        }
        Ok(())
    }

    pub fn get(&self, id: &NodeId) -> Option<&TaskNode> {
        self.index.get(id).map(|&index| &self.graph[index])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    /// Nodes that depend directly on `id`.
    pub fn dependents(&self, id: &NodeId) -> Vec<&TaskNode> {
        match self.index.get(id) {
            Some(&index) => {
                let mut indices: Vec<_> = self
                    .graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .collect();
                indices.sort();
                indices.into_iter().map(|i| &self.graph[i]).collect()
            }
            None => Vec::new(),
        }
    }

    // ========== Scheduling Operations ==========

    /// Nodes in dependency order (Kahn's algorithm).
    ///
    /// Among nodes that become available at the same time, insertion order
    /// wins.
    ///
    /// # Errors
    /// `CyclicGraph` listing every node that could not be ordered.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(index) = queue.pop_front() {
            order.push(index);
            let mut successors: Vec<_> = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .collect();
            successors.sort();
            for successor in successors {
                let degree = &mut in_degree[successor.index()];
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor);
                }
            }
        }

        if order.len() < self.len() {
            let ordered: HashSet<NodeIndex> = order.into_iter().collect();
            let unordered = self
                .graph
                .node_indices()
                .filter(|index| !ordered.contains(index))
                .map(|index| self.graph[index].id.clone())
                .collect();
            return Err(Error::CyclicGraph { unordered });
        }

        Ok(order
            .into_iter()
            .map(|index| self.graph[index].id.clone())
            .collect())
    }

    /// Pending nodes whose dependencies have all completed.
    ///
    /// Returned nodes are moved to Ready. Calling again without completing
    /// anything returns nothing new.
    pub fn ready_nodes(&mut self) -> Vec<NodeId> {
        let ready: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&index| {
                self.graph[index].status == NodeStatus::Pending
                    && self
                        .graph
                        .neighbors_directed(index, Direction::Incoming)
                        .all(|dep| self.graph[dep].status == NodeStatus::Completed)
            })
            .collect();

        ready
            .into_iter()
            .map(|index| {
                let node = &mut self.graph[index];
                node.mark_ready();
                node.id.clone()
            })
            .collect()
    }

    /// Ready → Running.
    pub fn mark_running(&mut self, id: &NodeId) -> Result<()> {
        let node = self.expect_status(id, "running", |s| *s == NodeStatus::Ready)?;
        node.start();
        Ok(())
    }

    /// Running → Completed.
    pub fn mark_completed(&mut self, id: &NodeId) -> Result<()> {
        let node = self.expect_status(id, "completed", |s| *s == NodeStatus::Running)?;
        node.complete();
        Ok(())
    }

    /// Running → Failed.
    pub fn mark_failed(&mut self, id: &NodeId, reason: &str) -> Result<()> {
        let node = self.expect_status(id, "failed", |s| *s == NodeStatus::Running)?;
        node.fail(reason);
        Ok(())
    }

    /// Fail every Pending node that depends, directly or transitively, on a
    /// failed node. Returns the ids that were failed.
    pub fn fail_blocked(&mut self) -> Result<Vec<NodeId>> {
        let mut failed = Vec::new();
        for id in self.topological_order()? {
            let index = self.index[&id];
            if self.graph[index].status != NodeStatus::Pending {
                continue;
            }
            let blocker = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .find(|&dep| matches!(self.graph[dep].status, NodeStatus::Failed { .. }))
                .map(|dep| self.graph[dep].id.clone());
            if let Some(blocker) = blocker {
                self.graph[index].fail(&format!("dependency failed: {}", blocker));
                failed.push(id);
            }
        }
        Ok(failed)
    }

    /// True once every node is Completed or Failed.
    pub fn is_finished(&self) -> bool {
        self.graph.node_weights().all(TaskNode::is_finished)
    }

    pub fn counts(&self) -> NodeCounts {
        let mut counts = NodeCounts::default();
        for node in self.graph.node_weights() {
            match node.status {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Ready => counts.ready += 1,
                NodeStatus::Running => counts.running += 1,
                NodeStatus::Completed => counts.completed += 1,
                NodeStatus::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// Snapshot of every node, in insertion order.
    pub fn summary(&self) -> Vec<TaskNode> {
        self.graph.node_weights().cloned().collect()
    }

    fn node_index(&self, id: &NodeId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownNode(id.clone()))
    }

    fn expect_status(
        &mut self,
        id: &NodeId,
        to: &str,
        allowed: impl Fn(&NodeStatus) -> bool,
    ) -> Result<&mut TaskNode> {
        let index = self.node_index(id)?;
        let node = &mut self.graph[index];
        if !allowed(&node.status) {
            return Err(Error::InvalidTransition {
                node: id.clone(),
                from: node.status.name().to_string(),
                to: to.to_string(),
            });
        }
        Ok(node)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
