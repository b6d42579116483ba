//! Per-agent change statistics and merge ordering.

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// Size of one agent's change relative to the delivery line it started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPrStats {
    pub agent: AgentId,
    pub additions: usize,
    pub deletions: usize,
    pub files_changed: usize,
}

impl AgentPrStats {
    pub fn new(agent: AgentId, additions: usize, deletions: usize, files_changed: usize) -> Self {
        Self {
            agent,
            additions,
            deletions,
            files_changed,
        }
    }

    pub fn total_changes(&self) -> usize {
        self.additions + self.deletions
    }
}

/// Largest change first, ties broken by agent id ascending.
pub fn merge_order(mut stats: Vec<AgentPrStats>) -> Vec<AgentPrStats> {
    stats.sort_by(|a, b| {
        b.total_changes()
            .cmp(&a.total_changes())
            .then_with(|| a.agent.cmp(&b.agent))
    });
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(agent: &str, additions: usize, deletions: usize) -> AgentPrStats {
        AgentPrStats::new(AgentId::new(agent).unwrap(), additions, deletions, 1)
    }

    fn totals(order: &[AgentPrStats]) -> Vec<usize> {
        order.iter().map(AgentPrStats::total_changes).collect()
    }

    #[test]
    fn test_total_changes() {
        assert_eq!(stats("a", 7, 3).total_changes(), 10);
    }

    #[test]
    fn test_merge_order_descending() {
        let order = merge_order(vec![stats("a", 50, 0), stats("b", 10, 0), stats("c", 20, 10)]);
        assert_eq!(totals(&order), vec![50, 30, 10]);
    }

    #[test]
    fn test_merge_order_ties_by_agent_id() {
        let order = merge_order(vec![stats("zed", 5, 5), stats("amy", 4, 6), stats("bob", 20, 0)]);
        let agents: Vec<_> = order.iter().map(|s| s.agent.as_str()).collect();
        assert_eq!(agents, vec!["bob", "amy", "zed"]);
    }

    #[test]
    fn test_merge_order_empty() {
        assert!(merge_order(Vec::new()).is_empty());
    }
}
