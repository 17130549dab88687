//! Per-task status records and the aggregated runner result.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{NodeId, RunnerId};
use crate::status::{RunnerState, TaskRunStatus};

/// Execution record of one TaskRun.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusEntry {
    /// Position of the run inside its runner.
    pub nr: usize,

    pub name: String,

    pub status: TaskRunStatus,

    pub started_at: Option<DateTime<Utc>>,

    pub stopped_at: Option<DateTime<Utc>>,

    pub duration_ms: Option<i64>,

    pub progress: u64,

    pub total: u64,

    /// Incoming values the task was invoked with.
    #[serde(default)]
    pub incoming: Map<String, Value>,

    /// Declared outgoing values the task produced.
    #[serde(default)]
    pub outgoing: Map<String, Value>,

    /// Full value returned by the executable.
    pub result: Option<Value>,

    pub error: Option<String>,

    /// Free-form counters incremented by the task.
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
}

impl TaskStatusEntry {
    /// Create a record for a freshly created run.
    pub fn new(nr: usize, name: impl Into<String>) -> Self {
        Self {
            nr,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Mark the run as started.
    pub fn start(&mut self, incoming: Map<String, Value>) {
        self.status = TaskRunStatus::Running;
        self.started_at = Some(Utc::now());
        self.incoming = incoming;
    }

    /// Mark the run as completed.
    pub fn complete(&mut self, result: Value, outgoing: Map<String, Value>) {
        self.status = TaskRunStatus::Done;
        self.result = Some(result);
        self.outgoing = outgoing;
        self.stop();
    }

    /// Mark the run as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskRunStatus::Errored;
        self.error = Some(error.into());
        self.stop();
    }

    fn stop(&mut self) {
        let now = Utc::now();
        self.stopped_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds());
    }
}

/// Counts snapshot of a runner, sent with every update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStats {
    pub state: RunnerState,
    pub todo: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    /// Sum of progress over all runs.
    pub progress: u64,
    /// Sum of declared totals over all runs.
    pub total: u64,
}

/// Aggregated outcome of one TaskRunner session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunnerResult {
    pub runner_id: RunnerId,

    /// Node the runner executed on.
    pub node_id: Option<NodeId>,

    /// Names of every task in the resolved closure, in schedule order.
    pub task_names: Vec<String>,

    pub tasks: Vec<TaskStatusEntry>,

    pub started_at: DateTime<Utc>,

    pub stopped_at: DateTime<Utc>,

    pub duration_ms: i64,

    /// Outgoing values accumulated over the whole session.
    #[serde(default)]
    pub outgoing: Map<String, Value>,
}

impl TaskRunnerResult {
    /// True when no task recorded an execution error.
    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|t| t.error.is_none())
    }

    /// Names of tasks that failed.
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.error.is_some())
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Look up the record of a task by name.
    pub fn task(&self, name: &str) -> Option<&TaskStatusEntry> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
