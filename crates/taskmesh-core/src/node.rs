//! Node capability information.

use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Capabilities a node advertises to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub node_id: NodeId,

    /// Node runs a worker and accepts task requests.
    pub is_worker: bool,

    /// Task names this node can execute.
    pub tasks: BTreeSet<String>,

    /// Node-level labels (region, hardware, role, etc.).
    pub labels: HashMap<String, String>,
}

impl NodeCapabilities {
    /// Create capabilities for a node without any tasks.
    pub fn new(node_id: NodeId, is_worker: bool) -> Self {
        Self {
            node_id,
            is_worker,
            tasks: BTreeSet::new(),
            labels: HashMap::new(),
        }
    }

    /// Check if this node advertises a given task.
    pub fn supports_task(&self, task_name: &str) -> bool {
        self.tasks.contains(task_name)
    }

    /// Check if this node advertises every one of the given tasks.
    pub fn supports_all<'a>(&self, mut names: impl Iterator<Item = &'a str>) -> bool {
        names.all(|n| self.supports_task(n))
    }

    /// Builder method to add a task.
    pub fn with_task(mut self, name: impl Into<String>) -> Self {
        self.tasks.insert(name.into());
        self
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_all() {
        let caps = NodeCapabilities::new(NodeId::new("n1"), true)
            .with_task("a")
            .with_task("b");
        assert!(caps.supports_all(["a", "b"].into_iter()));
        assert!(!caps.supports_all(["a", "c"].into_iter()));
    }
}
