//! Plan execution across rounds.

pub mod engine;
pub mod plan;

pub use engine::{ExecutionLoop, ExecutionReport, NodeReport, RoundReport};
pub use plan::{Plan, PlannedNode, Planner, StaticPlanner};
