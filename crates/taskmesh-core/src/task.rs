//! Task specification types shared between nodes.

use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a registered task is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskVariant {
    /// Async closure registered directly.
    #[default]
    Callback,
    /// Factory producing a fresh executable per run.
    Class,
    /// One shared executable for every run.
    Instance,
    /// No executable; completes once its subtasks are done.
    Group,
    /// Known only through remote node announcements.
    Remote,
}

/// A requested task: a name plus optional incoming overrides for that run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub incoming: Map<String, Value>,
}

impl TaskSpec {
    /// Create a spec without overrides.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            incoming: Map::new(),
        }
    }

    /// Builder method to add an incoming override.
    pub fn with_incoming(mut self, key: impl Into<String>, value: Value) -> Self {
        self.incoming.insert(key.into(), value);
        self
    }
}

impl From<&str> for TaskSpec {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TaskSpec {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Serializable description of a declared task property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default)]
    pub optional: bool,
}

impl PropertySpec {
    /// A property that must be supplied.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            optional: false,
        }
    }

    /// A property that may be absent.
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            optional: true,
        }
    }

    /// Builder method to set a default value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Where a task is known to be runnable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub has_worker: bool,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, has_worker: bool) -> Self {
        Self {
            node_id,
            has_worker,
        }
    }
}
