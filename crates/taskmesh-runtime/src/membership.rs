//! Cluster membership: known nodes and their advertised capabilities.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use taskmesh_core::{NodeAnnouncement, NodeCapabilities, NodeId};

/// Source of node identities and capabilities.
#[async_trait]
pub trait Membership: Send + Sync {
    fn local_node(&self) -> &NodeId;

    /// Every known node, including the local one.
    async fn known_nodes(&self) -> Vec<NodeId>;

    async fn capabilities(&self, node: &NodeId) -> Option<NodeCapabilities>;

    /// Nodes running a worker.
    async fn worker_nodes(&self) -> Vec<NodeId> {
        let mut workers = Vec::new();
        for node in self.known_nodes().await {
            if let Some(caps) = self.capabilities(&node).await {
                if caps.is_worker {
                    workers.push(node);
                }
            }
        }
        workers
    }

    /// Nodes advertising every one of `tasks`.
    async fn nodes_supporting(&self, tasks: &[String]) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        for node in self.known_nodes().await {
            if let Some(caps) = self.capabilities(&node).await {
                if caps.supports_all(tasks.iter().map(String::as_str)) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }
}

/// Membership kept in memory and fed by announcements.
pub struct StaticMembership {
    local: NodeId,
    nodes: RwLock<BTreeMap<NodeId, NodeCapabilities>>,
}

impl StaticMembership {
    pub fn new(local: NodeCapabilities) -> Self {
        let id = local.node_id.clone();
        let mut nodes = BTreeMap::new();
        nodes.insert(id.clone(), local);
        Self {
            local: id,
            nodes: RwLock::new(nodes),
        }
    }

    /// Insert or replace a node's capabilities.
    pub async fn upsert(&self, caps: NodeCapabilities) {
        debug!(node_id = %caps.node_id, tasks = caps.tasks.len(), "Node capabilities updated");
        self.nodes.write().await.insert(caps.node_id.clone(), caps);
    }

    pub async fn remove(&self, node: &NodeId) -> Option<NodeCapabilities> {
        let removed = self.nodes.write().await.remove(node);
        if removed.is_some() {
            info!(node_id = %node, "Node left");
        }
        removed
    }

    /// Fold an announcement into the node's capabilities.
    pub async fn apply(&self, announcement: &NodeAnnouncement) {
        let node_id = announcement.header.node_id.clone();
        let mut nodes = self.nodes.write().await;
        let caps = nodes
            .entry(node_id.clone())
            .or_insert_with(|| NodeCapabilities::new(node_id.clone(), announcement.has_worker));

        caps.is_worker = announcement.has_worker;
        if announcement.withdrawn {
            for task in &announcement.tasks {
                caps.tasks.remove(task);
            }
        } else {
            caps.tasks.extend(announcement.tasks.iter().cloned());
        }
        debug!(
            node_id = %node_id,
            withdrawn = announcement.withdrawn,
            tasks = announcement.tasks.len(),
            "Applied node announcement"
        );
    }

    /// Add tasks to the local node's advertised set.
    pub async fn advertise_local<I, S>(&self, tasks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(caps) = self.nodes.write().await.get_mut(&self.local) {
            caps.tasks.extend(tasks.into_iter().map(Into::into));
        }
    }
}

#[async_trait]
impl Membership for StaticMembership {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn known_nodes(&self) -> Vec<NodeId> {
        self.nodes.read().await.keys().cloned().collect()
    }

    async fn capabilities(&self, node: &NodeId) -> Option<NodeCapabilities> {
        self.nodes.read().await.get(node).cloned()
    }
}
