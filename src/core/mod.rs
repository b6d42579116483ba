//! Core scheduling model.
//!
//! Task nodes and the dependency graph that orders them.

pub mod graph;
pub mod node;

pub use graph::{NodeCounts, TaskGraph};
pub use node::{Assignment, NodeId, NodeStatus, TaskNode};
