//! Execution plans derived from the dependency graph

use serde::{Deserialize, Serialize};

/// Ordered level groups for one run
///
/// Derived, read-only, recomputed per orchestration run; never mutated in
/// place. Every agent's dependencies lie in strictly earlier groups. The
/// triggering change set rides along so agents see what they are reacting
/// to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub groups: Vec<Vec<String>>,
    pub total_agents: usize,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl ExecutionPlan {
    pub fn from_groups(groups: Vec<Vec<String>>) -> Self {
        let total_agents = groups.iter().map(Vec::len).sum();
        Self {
            groups,
            total_agents,
            changed_files: Vec::new(),
        }
    }

    pub fn with_changed_files(mut self, changed_files: Vec<String>) -> Self {
        self.changed_files = changed_files;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.total_agents == 0
    }

    /// All agent names in level order
    pub fn agents(&self) -> impl Iterator<Item = &String> {
        self.groups.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals() {
        let plan = ExecutionPlan::from_groups(vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
        ]);
        assert_eq!(plan.total_agents, 3);
        assert!(!plan.is_empty());
        assert_eq!(plan.agents().count(), 3);
    }

    #[test]
    fn test_empty() {
        let plan = ExecutionPlan::from_groups(Vec::new());
        assert!(plan.is_empty());
    }
}
