//! State enums for task events, runners and task runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State carried by a `TaskEvent` as seen across the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Request issued, not yet answered.
    #[default]
    Proposed,
    /// Accepted by a node and queued for execution.
    Enqueue,
    /// Runner started on the node.
    Started,
    /// Progress update from a running task.
    Running,
    /// Runner finished; payload holds the result.
    Stopped,
    /// Runner failed as a whole.
    Errored,
    /// Request rejected before execution (access, validation).
    RequestError,
}

impl TaskState {
    /// Returns true if no further state changes follow for this node.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Errored | Self::RequestError)
    }

    /// Returns true for failure terminals.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Errored | Self::RequestError)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Proposed => "proposed",
            Self::Enqueue => "enqueue",
            Self::Started => "started",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
            Self::RequestError => "request_error",
        };
        f.write_str(s)
    }
}

/// Channel a task event belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    #[default]
    Data,
    Log,
}

/// Lifecycle of one TaskRunner session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    #[default]
    Proposed,
    Started,
    Running,
    Stopped,
}

/// Lifecycle of a single TaskRun inside a runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    #[default]
    Created,
    Ready,
    Running,
    Done,
    Errored,
}

impl TaskRunStatus {
    /// Returns true once the run has completed, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Errored)
    }
}
