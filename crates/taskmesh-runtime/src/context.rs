//! Per-node runtime context.
//!
//! Everything a node needs (task graph, runner registry, transport,
//! membership, correlation and the task log) is owned by one [`NodeContext`]
//! passed explicitly to whoever needs it.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use taskmesh_core::{CoreError, NodeCapabilities, NodeId, TaskRunnerResult, TaskSpec};

use crate::bus::Transport;
use crate::config::RuntimeConfig;
use crate::correlation::{CorrelationOptions, Correlator};
use crate::exchange::TaskExchange;
use crate::graph::TaskGraph;
use crate::membership::{Membership, StaticMembership};
use crate::registry::RunnerRegistry;
use crate::runner::{RunnerError, TaskRunner, TaskRunnerBuilder};
use crate::task::TaskDef;
use crate::tasklog::{MemoryTaskLog, TaskLogStore};

pub struct NodeContext {
    config: RuntimeConfig,
    node_id: NodeId,
    has_worker: bool,
    graph: Arc<RwLock<TaskGraph>>,
    runners: Arc<RunnerRegistry>,
    transport: Arc<dyn Transport>,
    membership: Arc<StaticMembership>,
    correlator: Correlator,
    exchange: TaskExchange,
    task_log: Arc<dyn TaskLogStore>,
}

pub struct NodeContextBuilder {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    has_worker: bool,
    task_log: Option<Arc<dyn TaskLogStore>>,
}

impl NodeContextBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept task requests from other nodes.
    pub fn worker(mut self, has_worker: bool) -> Self {
        self.has_worker = has_worker;
        self
    }

    pub fn task_log(mut self, store: Arc<dyn TaskLogStore>) -> Self {
        self.task_log = Some(store);
        self
    }

    pub fn build(self) -> Arc<NodeContext> {
        let membership = Arc::new(StaticMembership::new(NodeCapabilities::new(
            self.node_id.clone(),
            self.has_worker,
        )));
        let dyn_membership: Arc<dyn Membership> = membership.clone();
        let correlator = Correlator::new(
            self.transport.clone(),
            dyn_membership.clone(),
            CorrelationOptions::from(&self.config),
        );
        let exchange = TaskExchange::new(correlator.clone(), self.transport.clone(), dyn_membership)
            .with_future_timeout(self.config.future_timeout());
        let task_log = self
            .task_log
            .unwrap_or_else(|| Arc::new(MemoryTaskLog::new(self.node_id.clone())));

        Arc::new(NodeContext {
            runners: Arc::new(RunnerRegistry::new(self.config.max_concurrent_runners)),
            config: self.config,
            node_id: self.node_id,
            has_worker: self.has_worker,
            graph: Arc::new(RwLock::new(TaskGraph::new())),
            transport: self.transport,
            membership,
            correlator,
            exchange,
            task_log,
        })
    }
}

impl NodeContext {
    pub fn builder(node_id: NodeId, transport: Arc<dyn Transport>) -> NodeContextBuilder {
        NodeContextBuilder {
            node_id,
            transport,
            config: RuntimeConfig::default(),
            has_worker: true,
            task_log: None,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn has_worker(&self) -> bool {
        self.has_worker
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<RwLock<TaskGraph>> {
        &self.graph
    }

    pub fn runners(&self) -> &Arc<RunnerRegistry> {
        &self.runners
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn membership(&self) -> &Arc<StaticMembership> {
        &self.membership
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn exchange(&self) -> &TaskExchange {
        &self.exchange
    }

    pub fn task_log(&self) -> &Arc<dyn TaskLogStore> {
        &self.task_log
    }

    /// Register a local task and advertise it in the local capabilities.
    pub async fn register(&self, def: TaskDef) -> Result<(), CoreError> {
        let name = def.name.clone();
        self.graph.write().await.add_task(def)?;
        self.membership.advertise_local([name.clone()]).await;
        debug!(node_id = %self.node_id, task = %name, "Task registered");
        Ok(())
    }

    /// Runner builder preconfigured for this node.
    pub fn runner(&self) -> TaskRunnerBuilder {
        TaskRunner::builder(self.graph.clone())
            .parallelism(self.config.runner_parallelism)
            .dry_run(self.config.dry_run)
            .node(self.node_id.clone())
            .registry(self.runners.clone())
    }

    /// Run tasks on this node and wait for the result.
    pub async fn run_local<I, S>(
        &self,
        specs: I,
        incoming: Map<String, Value>,
    ) -> Result<TaskRunnerResult, RunnerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskSpec>,
    {
        self.runner()
            .tasks(specs)
            .incoming(incoming)
            .build()
            .await?
            .run()
            .await
    }
}
