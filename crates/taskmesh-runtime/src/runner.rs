//! Dependency-graph task runner.
//!
//! A [`TaskRunner`] resolves the closure of the requested tasks (subtasks and
//! dependencies, recursively), orders the runs by weight and then drives them:
//! a run may start once every prerequisite is done, at most `parallelism` runs
//! execute at once. Task bodies run on spawned tokio tasks and report back to
//! the driver over an mpsc channel; the driver owns all runner state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use taskmesh_core::{
    CoreError, NodeId, RunnerId, RunnerState, RunnerStats, TaskRunStatus, TaskRunnerResult,
    TaskSpec, TaskStatusEntry, TaskVariant,
};

use crate::graph::TaskGraph;
use crate::registry::{RunnerInfo, RunnerRegistry};
use crate::task::{PropertyDef, TaskExecutable, TaskRef};
use crate::BoxError;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Runner errors. Any of these fails the whole session.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Definition(#[from] CoreError),

    #[error("Task '{task}' is missing required parameter '{parameter}'")]
    Validation { task: String, parameter: String },

    #[error("Task '{task}' parameter '{parameter}' is invalid: {reason}")]
    InvalidParameter {
        task: String,
        parameter: String,
        reason: String,
    },

    #[error(
        "Deadlock: {} task(s) can never start (blocked: {blocked:?}, failed: {failed:?})",
        .blocked.len()
    )]
    Deadlock {
        blocked: Vec<String>,
        failed: Vec<String>,
    },

    #[error("Runner limit reached ({limit} concurrent runners)")]
    ConcurrencyLimit { limit: usize },

    #[error("Runner is no longer accepting messages")]
    Channel,
}

/// Kind of a runner update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    Started,
    Progress { progress: u64, total: u64 },
    Log(String),
    Finished,
    Errored(String),
}

/// Notification emitted on every task transition.
#[derive(Debug, Clone)]
pub struct RunnerUpdate {
    pub runner_id: RunnerId,
    pub nr: usize,
    pub task: String,
    pub kind: UpdateKind,
    pub stats: RunnerStats,
}

enum RunnerMsg {
    Progress { nr: usize, progress: u64 },
    Total { nr: usize, total: u64 },
    Count { nr: usize, key: String, delta: i64 },
    Outgoing { nr: usize, key: String, value: Value },
    Log { nr: usize, message: String },
    AddTask {
        spec: TaskSpec,
        reply: oneshot::Sender<Result<usize, RunnerError>>,
    },
    Finished { nr: usize, outcome: Result<Value, String> },
}

/// Handle given to a running task.
pub struct TaskContext {
    runner_id: RunnerId,
    nr: usize,
    name: String,
    incoming: Map<String, Value>,
    runtime: Map<String, Value>,
    tx: mpsc::UnboundedSender<RunnerMsg>,
}

impl TaskContext {
    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    pub fn nr(&self) -> usize {
        self.nr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved incoming values.
    pub fn incoming(&self) -> &Map<String, Value> {
        &self.incoming
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.incoming.get(key)
    }

    /// Resolved runtime values.
    pub fn runtime(&self) -> &Map<String, Value> {
        &self.runtime
    }

    pub fn progress(&self, progress: u64) {
        self.send(RunnerMsg::Progress {
            nr: self.nr,
            progress,
        });
    }

    pub fn total(&self, total: u64) {
        self.send(RunnerMsg::Total { nr: self.nr, total });
    }

    /// Add `delta` to a named counter.
    pub fn count(&self, key: impl Into<String>, delta: i64) {
        self.send(RunnerMsg::Count {
            nr: self.nr,
            key: key.into(),
            delta,
        });
    }

    /// Stage an outgoing value; only declared outgoing keys are published.
    pub fn set_outgoing(&self, key: impl Into<String>, value: Value) {
        self.send(RunnerMsg::Outgoing {
            nr: self.nr,
            key: key.into(),
            value,
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        self.send(RunnerMsg::Log {
            nr: self.nr,
            message: message.into(),
        });
    }

    /// Spawn another task inside the same runner. Returns its run number.
    pub async fn add_task(
        &self,
        name: impl Into<String>,
        incoming: Map<String, Value>,
    ) -> Result<usize, RunnerError> {
        let (reply, rx) = oneshot::channel();
        let spec = TaskSpec {
            name: name.into(),
            incoming,
        };
        self.tx
            .send(RunnerMsg::AddTask { spec, reply })
            .map_err(|_| RunnerError::Channel)?;
        rx.await.map_err(|_| RunnerError::Channel)?
    }

    fn send(&self, msg: RunnerMsg) {
        // The driver outlives every context it hands out while running.
        let _ = self.tx.send(msg);
    }
}

/// One task's execution instance inside a runner.
pub struct TaskRun {
    nr: usize,
    task: TaskRef,
    prerequisites: Vec<usize>,
    overrides: Map<String, Value>,
    staged: Map<String, Value>,
    entry: TaskStatusEntry,
}

impl TaskRun {
    fn new(nr: usize, task: TaskRef, overrides: Map<String, Value>) -> Self {
        let entry = TaskStatusEntry::new(nr, task.name());
        Self {
            nr,
            task,
            prerequisites: Vec::new(),
            overrides,
            staged: Map::new(),
            entry,
        }
    }

    pub fn nr(&self) -> usize {
        self.nr
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// Run numbers of subtasks and dependencies.
    pub fn prerequisites(&self) -> &[usize] {
        &self.prerequisites
    }

    /// Scheduling weight: number of prerequisite edges.
    pub fn weight(&self) -> usize {
        self.prerequisites.len()
    }

    pub fn status(&self) -> TaskRunStatus {
        self.entry.status
    }

    pub fn entry(&self) -> &TaskStatusEntry {
        &self.entry
    }
}

/// Builder for a [`TaskRunner`].
pub struct TaskRunnerBuilder {
    graph: Arc<RwLock<TaskGraph>>,
    specs: Vec<TaskSpec>,
    incoming: Map<String, Value>,
    parallelism: usize,
    dry_run: bool,
    node_id: Option<NodeId>,
    registry: Option<Arc<RunnerRegistry>>,
}

impl TaskRunnerBuilder {
    pub fn tasks<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskSpec>,
    {
        self.specs.extend(specs.into_iter().map(Into::into));
        self
    }

    /// Caller-supplied incoming values shared by every task.
    pub fn incoming(mut self, incoming: Map<String, Value>) -> Self {
        self.incoming = incoming;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Register the runner for introspection and concurrency limiting.
    pub fn registry(mut self, registry: Arc<RunnerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resolve the task closure against the graph.
    pub async fn build(self) -> Result<TaskRunner, RunnerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let mut runner = TaskRunner {
            id: RunnerId::generate(),
            node_id: self.node_id,
            graph: self.graph,
            runs: Vec::new(),
            index: HashMap::new(),
            order: Vec::new(),
            todo: BTreeSet::new(),
            running: BTreeSet::new(),
            done: BTreeSet::new(),
            failed: BTreeSet::new(),
            incoming: self.incoming,
            outgoing: Map::new(),
            state: RunnerState::Proposed,
            parallelism: self.parallelism,
            dry_run: self.dry_run,
            registry: self.registry,
            updates,
            tx,
            rx,
            started_at: None,
        };

        {
            let graph = runner.graph.clone();
            let graph = graph.read().await;
            for spec in self.specs {
                runner.expand(&graph, spec)?;
            }
        }
        runner.reorder();
        runner.todo = (0..runner.runs.len()).collect();

        debug!(
            runner_id = %runner.id,
            runs = runner.runs.len(),
            "Resolved task closure"
        );
        Ok(runner)
    }
}

/// One execution session over a resolved task closure.
pub struct TaskRunner {
    id: RunnerId,
    node_id: Option<NodeId>,
    graph: Arc<RwLock<TaskGraph>>,
    runs: Vec<TaskRun>,
    index: HashMap<String, usize>,
    /// Run numbers sorted by ascending weight.
    order: Vec<usize>,
    todo: BTreeSet<usize>,
    running: BTreeSet<usize>,
    done: BTreeSet<usize>,
    failed: BTreeSet<usize>,
    incoming: Map<String, Value>,
    outgoing: Map<String, Value>,
    state: RunnerState,
    parallelism: usize,
    dry_run: bool,
    registry: Option<Arc<RunnerRegistry>>,
    updates: broadcast::Sender<RunnerUpdate>,
    tx: mpsc::UnboundedSender<RunnerMsg>,
    rx: mpsc::UnboundedReceiver<RunnerMsg>,
    started_at: Option<DateTime<Utc>>,
}

impl TaskRunner {
    pub fn builder(graph: Arc<RwLock<TaskGraph>>) -> TaskRunnerBuilder {
        TaskRunnerBuilder {
            graph,
            specs: Vec::new(),
            incoming: Map::new(),
            parallelism: 5,
            dry_run: false,
            node_id: None,
            registry: None,
        }
    }

    pub fn id(&self) -> &RunnerId {
        &self.id
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Runs in schedule order.
    pub fn runs(&self) -> impl Iterator<Item = &TaskRun> {
        self.order.iter().map(|&nr| &self.runs[nr])
    }

    /// Task names in schedule order.
    pub fn task_names(&self) -> Vec<String> {
        self.runs().map(|run| run.name().to_string()).collect()
    }

    /// Receive an update for every task transition.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerUpdate> {
        self.updates.subscribe()
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            state: self.state,
            todo: self.todo.len(),
            running: self.running.len(),
            done: self.done.len(),
            failed: self.failed.len(),
            progress: self.runs.iter().map(|r| r.entry.progress).sum(),
            total: self.runs.iter().map(|r| r.entry.total).sum(),
        }
    }

    /// Check that every required property of every run can be satisfied
    /// before anything executes.
    pub fn validate(&self) -> Result<(), RunnerError> {
        for run in &self.runs {
            for prop in run.task.incoming() {
                if prop.is_optional() || prop.default_value().is_some() {
                    continue;
                }
                let name = prop.name();
                let produced = self.runs.iter().any(|other| {
                    other.nr != run.nr && other.task.outgoing().iter().any(|o| o.name() == name)
                });
                if !(run.overrides.contains_key(name) || self.incoming.contains_key(name) || produced)
                {
                    return Err(RunnerError::Validation {
                        task: run.name().to_string(),
                        parameter: name.to_string(),
                    });
                }
            }
            for prop in run.task.runtime() {
                if prop.is_optional() || prop.default_value().is_some() {
                    continue;
                }
                let name = prop.name();
                if !(run.overrides.contains_key(name) || self.incoming.contains_key(name)) {
                    return Err(RunnerError::Validation {
                        task: run.name().to_string(),
                        parameter: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Execute the session to completion.
    pub async fn run(mut self) -> Result<TaskRunnerResult, RunnerError> {
        self.validate()?;

        if let Some(registry) = &self.registry {
            registry.register(RunnerInfo {
                id: self.id.clone(),
                node_id: self.node_id.clone(),
                tasks: self.task_names(),
                started_at: Utc::now(),
            })?;
        }

        self.state = RunnerState::Started;
        self.started_at = Some(Utc::now());
        info!(
            runner_id = %self.id,
            tasks = self.runs.len(),
            parallelism = self.parallelism,
            dry_run = self.dry_run,
            "Runner started"
        );

        self.state = RunnerState::Running;
        let outcome = self.drive().await;
        self.state = RunnerState::Stopped;

        if let Some(registry) = &self.registry {
            registry.remove(&self.id);
        }

        match outcome {
            Ok(()) => {
                let result = self.result();
                info!(
                    runner_id = %self.id,
                    duration_ms = result.duration_ms,
                    failed = result.failed_tasks().len(),
                    "Runner finished"
                );
                Ok(result)
            }
            Err(e) => {
                error!(runner_id = %self.id, error = %e, "Runner failed");
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), RunnerError> {
        loop {
            while self.running.len() < self.parallelism {
                let Some(nr) = self.select_next() else {
                    break;
                };
                self.start(nr)?;
            }

            if self.todo.is_empty() && self.running.is_empty() {
                return Ok(());
            }

            if self.running.is_empty() {
                return Err(RunnerError::Deadlock {
                    blocked: self.names_of(&self.todo),
                    failed: self.names_of(&self.failed),
                });
            }

            let msg = self.rx.recv().await.ok_or(RunnerError::Channel)?;
            self.handle(msg).await;
        }
    }

    /// First run in schedule order whose prerequisites are all done.
    fn select_next(&self) -> Option<usize> {
        self.order.iter().copied().find(|nr| {
            self.todo.contains(nr)
                && self.runs[*nr]
                    .prerequisites
                    .iter()
                    .all(|p| self.done.contains(p))
        })
    }

    fn start(&mut self, nr: usize) -> Result<(), RunnerError> {
        self.todo.remove(&nr);
        self.running.insert(nr);

        let run = &self.runs[nr];
        let incoming = self.resolve_properties(run, run.task.incoming(), true)?;
        let runtime = self.resolve_properties(run, run.task.runtime(), false)?;
        let task = run.task.clone();

        self.runs[nr].entry.start(incoming.clone());
        self.runs[nr].entry.status = TaskRunStatus::Running;
        debug!(runner_id = %self.id, task = %task.name(), nr, "Task started");
        self.emit(nr, UpdateKind::Started);

        let exec: Option<Arc<dyn TaskExecutable>> = if self.dry_run {
            Some(Arc::new(DryRun))
        } else {
            task.executable().instantiate()
        };

        let exec = match (exec, task.variant()) {
            (Some(exec), _) => exec,
            (None, TaskVariant::Remote) => {
                self.finish_now(
                    nr,
                    Err(format!("task '{}' is only available on remote nodes", task.name())),
                );
                return Ok(());
            }
            (None, _) => {
                self.finish_now(nr, Ok(Value::Null));
                return Ok(());
            }
        };

        let ctx = TaskContext {
            runner_id: self.id.clone(),
            nr,
            name: task.name().to_string(),
            incoming,
            runtime,
            tx: self.tx.clone(),
        };
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let body = tokio::spawn(async move { exec.exec(ctx).await.map_err(|e| e.to_string()) });
            let outcome = match body.await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("task panicked: {e}")),
            };
            let _ = tx.send(RunnerMsg::Finished { nr, outcome });
        });

        Ok(())
    }

    fn finish_now(&self, nr: usize, outcome: Result<Value, String>) {
        let _ = self.tx.send(RunnerMsg::Finished { nr, outcome });
    }

    /// Look a property up in the run overrides, the shared outgoing map
    /// (incoming properties only), the caller incoming map, then its default.
    fn resolve_properties(
        &self,
        run: &TaskRun,
        props: &[PropertyDef],
        from_outgoing: bool,
    ) -> Result<Map<String, Value>, RunnerError> {
        let mut values = Map::new();
        for prop in props {
            let name = prop.name();
            let found = run
                .overrides
                .get(name)
                .or_else(|| {
                    from_outgoing
                        .then(|| self.outgoing.get(name))
                        .flatten()
                })
                .or_else(|| self.incoming.get(name))
                .or_else(|| prop.default_value())
                .cloned();

            let value = match found {
                Some(value) => value,
                None if prop.is_optional() => continue,
                None if self.dry_run => Value::Null,
                None => {
                    return Err(RunnerError::Validation {
                        task: run.name().to_string(),
                        parameter: name.to_string(),
                    })
                }
            };

            let value = prop
                .convert(value)
                .map_err(|reason| RunnerError::InvalidParameter {
                    task: run.name().to_string(),
                    parameter: name.to_string(),
                    reason,
                })?;
            values.insert(name.to_string(), value);
        }
        Ok(values)
    }

    async fn handle(&mut self, msg: RunnerMsg) {
        match msg {
            RunnerMsg::Progress { nr, progress } => {
                self.runs[nr].entry.progress = progress;
                self.emit_progress(nr);
            }
            RunnerMsg::Total { nr, total } => {
                self.runs[nr].entry.total = total;
                self.emit_progress(nr);
            }
            RunnerMsg::Count { nr, key, delta } => {
                *self.runs[nr].entry.counters.entry(key).or_insert(0) += delta;
            }
            RunnerMsg::Outgoing { nr, key, value } => {
                self.runs[nr].staged.insert(key, value);
            }
            RunnerMsg::Log { nr, message } => {
                debug!(runner_id = %self.id, task = %self.runs[nr].name(), "{}", message);
                self.emit(nr, UpdateKind::Log(message));
            }
            RunnerMsg::AddTask { spec, reply } => {
                let result = self.add_task(spec).await;
                let _ = reply.send(result);
            }
            RunnerMsg::Finished { nr, outcome } => self.complete(nr, outcome),
        }
    }

    fn complete(&mut self, nr: usize, outcome: Result<Value, String>) {
        self.running.remove(&nr);

        match outcome {
            Ok(value) => {
                let run = &mut self.runs[nr];
                let mut produced = std::mem::take(&mut run.staged);
                if let Value::Object(map) = &value {
                    produced.extend(map.clone());
                }

                let mut published = Map::new();
                for prop in run.task.outgoing() {
                    let found = produced
                        .get(prop.name())
                        .or_else(|| prop.default_value())
                        .cloned();
                    let Some(found) = found else {
                        continue;
                    };
                    match prop.convert(found) {
                        Ok(converted) => {
                            published.insert(prop.name().to_string(), converted);
                        }
                        Err(reason) => {
                            warn!(
                                task = %run.name(),
                                parameter = %prop.name(),
                                reason = %reason,
                                "Dropping unconvertible outgoing value"
                            );
                        }
                    }
                }

                self.outgoing.extend(published.clone());
                run.entry.complete(value, published);
                self.done.insert(nr);
                debug!(runner_id = %self.id, task = %self.runs[nr].name(), nr, "Task finished");
                self.emit(nr, UpdateKind::Finished);
            }
            Err(e) => {
                self.runs[nr].entry.fail(e.clone());
                self.failed.insert(nr);
                warn!(
                    runner_id = %self.id,
                    task = %self.runs[nr].name(),
                    error = %e,
                    "Task failed"
                );
                self.emit(nr, UpdateKind::Errored(e));
            }
        }
    }

    async fn add_task(&mut self, spec: TaskSpec) -> Result<usize, RunnerError> {
        let before = self.runs.len();
        let nr = {
            let graph = self.graph.clone();
            let graph = graph.read().await;
            self.expand_fresh(&graph, spec)?
        };
        self.todo.extend(before..self.runs.len());
        self.reorder();
        debug!(runner_id = %self.id, task = %self.runs[nr].name(), nr, "Task added at runtime");
        Ok(nr)
    }

    /// Add a run for `spec`, reusing existing runs for its prerequisites.
    fn expand_fresh(&mut self, graph: &TaskGraph, spec: TaskSpec) -> Result<usize, RunnerError> {
        let task = graph.resolve(&spec.name)?;
        let nr = self.runs.len();
        self.runs.push(TaskRun::new(nr, task, spec.incoming));
        self.index.entry(spec.name.clone()).or_insert(nr);

        let mut prerequisites = Vec::new();
        for name in graph
            .subtasks(&spec.name)
            .into_iter()
            .chain(graph.dependencies(&spec.name))
        {
            prerequisites.push(self.expand(graph, TaskSpec::new(name))?);
        }
        self.runs[nr].prerequisites = prerequisites;
        Ok(nr)
    }

    /// Add a run for `spec` unless one with the same name exists.
    fn expand(&mut self, graph: &TaskGraph, spec: TaskSpec) -> Result<usize, RunnerError> {
        if let Some(&nr) = self.index.get(&spec.name) {
            self.runs[nr].overrides.extend(spec.incoming);
            return Ok(nr);
        }
        self.expand_fresh(graph, spec)
    }

    fn reorder(&mut self) {
        let mut order: Vec<usize> = (0..self.runs.len()).collect();
        order.sort_by_key(|&nr| self.runs[nr].weight());
        self.order = order;
    }

    fn names_of(&self, set: &BTreeSet<usize>) -> Vec<String> {
        set.iter()
            .map(|&nr| self.runs[nr].name().to_string())
            .collect()
    }

    fn emit_progress(&self, nr: usize) {
        let entry = &self.runs[nr].entry;
        self.emit(
            nr,
            UpdateKind::Progress {
                progress: entry.progress,
                total: entry.total,
            },
        );
    }

    fn emit(&self, nr: usize, kind: UpdateKind) {
        // No subscribers is fine.
        let _ = self.updates.send(RunnerUpdate {
            runner_id: self.id.clone(),
            nr,
            task: self.runs[nr].name().to_string(),
            kind,
            stats: self.stats(),
        });
    }

    fn result(&self) -> TaskRunnerResult {
        let started_at = self.started_at.unwrap_or_else(Utc::now);
        let stopped_at = Utc::now();
        TaskRunnerResult {
            runner_id: self.id.clone(),
            node_id: self.node_id.clone(),
            task_names: self.task_names(),
            tasks: self.runs().map(|run| run.entry.clone()).collect(),
            started_at,
            stopped_at,
            duration_ms: (stopped_at - started_at).num_milliseconds(),
            outgoing: self.outgoing.clone(),
        }
    }
}

/// Stand-in body used in dry-run mode.
struct DryRun;

#[async_trait::async_trait]
impl TaskExecutable for DryRun {
    async fn exec(&self, _ctx: TaskContext) -> Result<Value, BoxError> {
        Ok(Value::Null)
    }
}
