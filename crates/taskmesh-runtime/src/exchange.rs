//! Remote task execution.
//!
//! Dispatch happens in two phases. Phase one is a correlated [`TaskEvent`]
//! request answered by every addressed node with `enqueue` or
//! `request_error`; it completes as soon as every node has acknowledged.
//! Phase two is a [`TaskFuture`] keyed by the request id which follows the
//! state events the nodes publish until each reaches a terminal state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskmesh_core::{
    EventError, EventId, NodeId, TaskEvent, TaskListing, TaskQuery, TaskRunnerResult, TaskSpec,
    TaskState, Topic,
};

use crate::bus::{response_topic, Subscription, Transport};
use crate::correlation::{
    Collector, CorrelationError, CorrelationOutcome, Correlator, ItemsCollector, ItemsOutput,
    OutputMode,
};
use crate::membership::Membership;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("No target node can run {tasks:?}")]
    TargetUnavailable { tasks: Vec<String> },

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("Node {node_id} rejected the request: {reason}")]
    Rejected { node_id: NodeId, reason: String },

    #[error("Timed out waiting for {pending:?}")]
    FutureTimeout { pending: Vec<NodeId> },

    #[error("Task future closed before completion")]
    Closed,
}

/// A request to run tasks on remote nodes.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub tasks: Vec<TaskSpec>,
    pub parameters: Map<String, Value>,
    /// Restrict candidates to these nodes.
    pub targets: Option<Vec<NodeId>>,
    /// Send to a random subset of this size.
    pub fan_out: Option<usize>,
}

impl ExecRequest {
    pub fn new<I, S>(tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskSpec>,
    {
        Self {
            tasks: tasks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_targets(mut self, targets: Vec<NodeId>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_fan_out(mut self, n: usize) -> Self {
        self.fan_out = Some(n);
        self
    }

    fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }
}

/// Acknowledgements of phase one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchAck {
    pub accepted: Vec<NodeId>,
    pub rejected: Vec<(NodeId, EventError)>,
}

/// Splits phase-one responses into accepted and rejected nodes.
pub struct AckCollector;

impl Collector<TaskEvent> for AckCollector {
    type Output = DispatchAck;

    fn collect(self, responses: Vec<TaskEvent>) -> DispatchAck {
        let mut ack = DispatchAck::default();
        for response in responses {
            let node = response.header.node_id.clone();
            match (response.state, response.header.error) {
                (TaskState::RequestError, error) => ack.rejected.push((
                    node,
                    error.unwrap_or_else(|| EventError::new("rejected", "request rejected")),
                )),
                (_, Some(error)) => ack.rejected.push((node, error)),
                _ => ack.accepted.push(node),
            }
        }
        ack
    }
}

/// Outcome of a dispatched request.
pub struct Dispatch {
    pub request_id: EventId,
    pub ack: DispatchAck,
    /// Targets that never acknowledged.
    pub missing: Vec<NodeId>,
    pub future: TaskFuture,
}

/// Sends task requests to remote nodes.
#[derive(Clone)]
pub struct TaskExchange {
    correlator: Correlator,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    future_timeout: Option<Duration>,
}

impl TaskExchange {
    pub fn new(
        correlator: Correlator,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
    ) -> Self {
        Self {
            correlator,
            transport,
            membership,
            future_timeout: None,
        }
    }

    /// Default timeout used by [`TaskExchange::run`].
    pub fn with_future_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.future_timeout = timeout;
        self
    }

    /// Workers advertising every task, restricted to `hint`, optionally
    /// narrowed to a random subset of `fan_out` nodes.
    pub async fn select_targets(
        &self,
        tasks: &[String],
        hint: Option<&[NodeId]>,
        fan_out: Option<usize>,
    ) -> Result<Vec<NodeId>, ExchangeError> {
        let workers: BTreeSet<NodeId> = self.membership.worker_nodes().await.into_iter().collect();
        let mut targets: Vec<NodeId> = self
            .membership
            .nodes_supporting(tasks)
            .await
            .into_iter()
            .filter(|node| workers.contains(node))
            .filter(|node| hint.map_or(true, |hint| hint.contains(node)))
            .collect();

        if let Some(n) = fan_out {
            if n < targets.len() {
                let mut rng = rand::thread_rng();
                targets = targets.choose_multiple(&mut rng, n).cloned().collect();
                targets.sort();
            }
        }

        if targets.is_empty() {
            return Err(ExchangeError::TargetUnavailable {
                tasks: tasks.to_vec(),
            });
        }
        Ok(targets)
    }

    /// Dispatch a request and return the acknowledgements with a future
    /// following completion.
    pub async fn execute(&self, request: ExecRequest) -> Result<Dispatch, ExchangeError> {
        let names = request.task_names();
        let targets = self
            .select_targets(&names, request.targets.as_deref(), request.fan_out)
            .await?;
        info!(tasks = ?names, targets = ?targets, "Dispatching tasks");

        let event = TaskEvent::request(request.tasks, request.parameters);
        let event = self.correlator.stamp(event, Some(targets.clone())).await?;
        let request_id = event.header.id.clone();

        // Subscribe before publishing so no state event can be missed.
        let future = TaskFuture::start(
            self.transport.clone(),
            self.correlator.local_node().clone(),
            request_id.clone(),
            targets,
        )
        .await?;

        let outcome: CorrelationOutcome<DispatchAck> = match self
            .correlator
            .send_stamped::<TaskEvent, TaskEvent, _>(event, AckCollector)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                future.close();
                return Err(e.into());
            }
        };

        for (node_id, error) in &outcome.output.rejected {
            warn!(
                request_id = %request_id,
                node_id = %node_id,
                code = %error.code,
                reason = %error.message,
                "Node rejected task request"
            );
        }

        if outcome.output.accepted.is_empty() {
            future.close();
            let (node_id, reason) = match outcome.output.rejected.first() {
                Some((node, error)) => (node.clone(), error.message.clone()),
                None => (
                    outcome
                        .responded
                        .first()
                        .cloned()
                        .unwrap_or_else(|| self.correlator.local_node().clone()),
                    "no node accepted the request".to_string(),
                ),
            };
            return Err(ExchangeError::Rejected { node_id, reason });
        }

        future.narrow(&outcome.responded);

        Ok(Dispatch {
            request_id,
            ack: outcome.output,
            missing: outcome.missing,
            future,
        })
    }

    /// Dispatch and wait for completion.
    pub async fn run(&self, request: ExecRequest) -> Result<FutureOutcome, ExchangeError> {
        let dispatch = self.execute(request).await?;
        let outcome = dispatch.future.wait(self.future_timeout).await;
        dispatch.future.close();
        outcome
    }

    /// Ask every known node which tasks it offers.
    pub async fn list_remote_tasks(
        &self,
        pattern: Option<String>,
        mode: OutputMode,
    ) -> Result<CorrelationOutcome<ItemsOutput>, ExchangeError> {
        let query = TaskQuery {
            pattern,
            ..Default::default()
        };
        let collector = ItemsCollector::new().sort_by("name", false).mode(mode);
        Ok(self
            .correlator
            .send::<TaskQuery, TaskListing, _>(query, None, collector)
            .await?)
    }
}

/// Latest known state of one node's execution.
#[derive(Debug, Clone, Default)]
pub struct NodeProgress {
    pub state: TaskState,
    /// Payload of the terminal event.
    pub data: Option<Value>,
    pub error: Option<EventError>,
    pub logs: Vec<String>,
}

impl NodeProgress {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Runner result carried by a `stopped` event.
    pub fn runner_result(&self) -> Option<TaskRunnerResult> {
        self.data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }
}

/// Per-node results of a completed future.
#[derive(Debug, Clone)]
pub struct FutureOutcome {
    pub request_id: EventId,
    pub nodes: BTreeMap<NodeId, NodeProgress>,
}

impl FutureOutcome {
    /// True if every node stopped without error.
    pub fn is_success(&self) -> bool {
        self.nodes
            .values()
            .all(|p| p.state == TaskState::Stopped && p.error.is_none())
    }
}

struct FutureState {
    targets: BTreeSet<NodeId>,
    nodes: BTreeMap<NodeId, NodeProgress>,
}

impl FutureState {
    fn record(&mut self, event: TaskEvent) {
        let node = event.header.node_id.clone();
        if !self.targets.contains(&node) {
            return;
        }
        let progress = self.nodes.entry(node).or_default();
        if progress.is_terminal() {
            return;
        }

        if event.topic == Topic::Log {
            if let Some(line) = event.data {
                progress.logs.push(match line {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            return;
        }

        progress.state = event.state;
        if event.state.is_terminal() {
            progress.data = event.data;
            progress.error = event.header.error;
        }
    }

    fn pending(&self) -> Vec<NodeId> {
        self.targets
            .iter()
            .filter(|node| !self.nodes.get(*node).is_some_and(NodeProgress::is_terminal))
            .cloned()
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.pending().is_empty()
    }
}

/// Follows the completion of a dispatched request on every target node.
pub struct TaskFuture {
    request_id: EventId,
    state: Arc<Mutex<FutureState>>,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    tracker: JoinHandle<()>,
}

impl TaskFuture {
    /// Subscribe to state events for `request_id` from `targets`.
    pub async fn start(
        transport: Arc<dyn Transport>,
        local: NodeId,
        request_id: EventId,
        targets: Vec<NodeId>,
    ) -> Result<Self, ExchangeError> {
        let subscription = transport
            .subscribe(&response_topic::<TaskEvent>())
            .await
            .map_err(CorrelationError::from)?;

        let state = Arc::new(Mutex::new(FutureState {
            targets: targets.into_iter().collect(),
            nodes: BTreeMap::new(),
        }));
        let (done_tx, done_rx) = watch::channel(false);
        let done_tx = Arc::new(done_tx);

        let tracker = tokio::spawn(track(
            subscription,
            local,
            request_id.clone(),
            state.clone(),
            done_tx.clone(),
        ));

        Ok(Self {
            request_id,
            state,
            done_tx,
            done_rx,
            tracker,
        })
    }

    pub fn request_id(&self) -> &EventId {
        &self.request_id
    }

    /// Restrict the nodes waited for.
    pub fn narrow(&self, nodes: &[NodeId]) {
        let complete = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.targets.retain(|t| nodes.contains(t));
            state.is_complete()
        };
        if complete {
            signal(&self.done_tx, &self.request_id);
        }
    }

    /// Nodes that have not reached a terminal state.
    pub fn pending(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending()
    }

    /// Latest progress of every node heard from so far.
    pub fn snapshot(&self) -> BTreeMap<NodeId, NodeProgress> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .clone()
    }

    /// Receiver flipping to `true` exactly once, on completion or close.
    pub fn completed(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Wait until every node is terminal, or until `timeout`.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<FutureOutcome, ExchangeError> {
        let mut done = self.done_rx.clone();
        let waiting = async move {
            let finished = done.wait_for(|d| *d).await.map(|_| ());
            finished
        };

        let finished = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, waiting).await {
                Ok(finished) => finished,
                Err(_) => {
                    return Err(ExchangeError::FutureTimeout {
                        pending: self.pending(),
                    })
                }
            },
            None => waiting.await,
        };
        if finished.is_err() {
            return Err(ExchangeError::Closed);
        }

        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_complete() {
            return Err(ExchangeError::Closed);
        }
        Ok(FutureOutcome {
            request_id: self.request_id.clone(),
            nodes: state
                .nodes
                .iter()
                .filter(|(node, _)| state.targets.contains(*node))
                .map(|(node, progress)| (node.clone(), progress.clone()))
                .collect(),
        })
    }

    /// Stop following events. Idempotent.
    pub fn close(&self) {
        self.tracker.abort();
        signal(&self.done_tx, &self.request_id);
    }
}

impl Drop for TaskFuture {
    fn drop(&mut self) {
        self.tracker.abort();
    }
}

async fn track(
    mut subscription: Subscription,
    local: NodeId,
    request_id: EventId,
    state: Arc<Mutex<FutureState>>,
    done_tx: Arc<watch::Sender<bool>>,
) {
    while let Ok(event) = subscription.recv_message::<TaskEvent>().await {
        if event.header.req_event_id.as_ref() != Some(&request_id)
            || !event.header.is_addressed_to(&local)
        {
            continue;
        }
        debug!(
            request_id = %request_id,
            node_id = %event.header.node_id,
            state = %event.state,
            "Task state event"
        );

        let complete = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.record(event);
            state.is_complete()
        };
        if complete {
            signal(&done_tx, &request_id);
            break;
        }
    }
}

/// Flip the completion flag once.
fn signal(done_tx: &watch::Sender<bool>, request_id: &EventId) {
    let flipped = done_tx.send_if_modified(|done| {
        if *done {
            false
        } else {
            *done = true;
            true
        }
    });
    if flipped {
        info!(request_id = %request_id, "Task future completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{publish_message, request_topic, LocalBus};
    use crate::correlation::CorrelationOptions;
    use crate::membership::StaticMembership;
    use serde_json::json;
    use taskmesh_core::NodeCapabilities;

    #[derive(Clone, Copy, PartialEq)]
    enum Worker {
        Completes,
        Rejects,
        Hangs,
    }

    /// Fake worker: acknowledges, then publishes started and stopped.
    async fn worker(bus: Arc<LocalBus>, node: &str, behaviour: Worker) {
        let node = NodeId::new(node);
        let mut requests = bus.subscribe(&request_topic::<TaskEvent>()).await.unwrap();
        tokio::spawn(async move {
            while let Ok(request) = requests.recv_message::<TaskEvent>().await {
                if !request.header.is_addressed_to(&node) {
                    continue;
                }
                let topic = response_topic::<TaskEvent>();
                let publish = |event: TaskEvent| {
                    let bus = bus.clone();
                    let topic = topic.clone();
                    async move { publish_message(bus.as_ref(), &topic, &event).await.unwrap() }
                };

                if behaviour == Worker::Rejects {
                    publish(
                        TaskEvent::reply(&request, &node, TaskState::RequestError)
                            .with_error(EventError::new("access_denied", "not allowed here")),
                    )
                    .await;
                    continue;
                }
                publish(TaskEvent::reply(&request, &node, TaskState::Enqueue)).await;
                if behaviour == Worker::Hangs {
                    continue;
                }
                publish(TaskEvent::reply(&request, &node, TaskState::Started)).await;
                publish(
                    TaskEvent::reply(&request, &node, TaskState::Running)
                        .with_topic(Topic::Log)
                        .with_data(json!("halfway")),
                )
                .await;
                publish(
                    TaskEvent::reply(&request, &node, TaskState::Stopped)
                        .with_data(json!({"node": node.as_str()})),
                )
                .await;
            }
        });
    }

    async fn exchange(bus: &Arc<LocalBus>, workers: &[(&str, bool)]) -> TaskExchange {
        let membership = Arc::new(StaticMembership::new(NodeCapabilities::new(
            NodeId::new("origin"),
            false,
        )));
        for (node, is_worker) in workers {
            membership
                .upsert(NodeCapabilities::new(NodeId::new(*node), *is_worker).with_task("build"))
                .await;
        }
        let options = CorrelationOptions {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let correlator = Correlator::new(bus.clone(), membership.clone(), options);
        TaskExchange::new(correlator, bus.clone(), membership)
    }

    #[tokio::test]
    async fn test_select_targets_intersects_workers_and_hint() {
        let bus = Arc::new(LocalBus::new());
        let exchange = exchange(&bus, &[("w1", true), ("w2", true), ("n3", false)]).await;
        let build = vec!["build".to_string()];

        let all = exchange.select_targets(&build, None, None).await.unwrap();
        assert_eq!(all, vec![NodeId::new("w1"), NodeId::new("w2")]);

        let hinted = exchange
            .select_targets(&build, Some(&[NodeId::new("w2"), NodeId::new("n3")]), None)
            .await
            .unwrap();
        assert_eq!(hinted, vec![NodeId::new("w2")]);

        let one = exchange.select_targets(&build, None, Some(1)).await.unwrap();
        assert_eq!(one.len(), 1);

        let err = exchange
            .select_targets(&["deploy".to_string()], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::TargetUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_execute_and_wait_for_completion() {
        let bus = Arc::new(LocalBus::new());
        worker(bus.clone(), "w1", Worker::Completes).await;
        worker(bus.clone(), "w2", Worker::Completes).await;
        let exchange = exchange(&bus, &[("w1", true), ("w2", true)]).await;

        let dispatch = exchange.execute(ExecRequest::new(["build"])).await.unwrap();
        assert_eq!(dispatch.ack.accepted.len(), 2);

        let outcome = dispatch
            .future
            .wait(Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.nodes.len(), 2);
        let w1 = &outcome.nodes[&NodeId::new("w1")];
        assert_eq!(w1.data, Some(json!({"node": "w1"})));
        assert_eq!(w1.logs, vec!["halfway"]);
    }

    #[tokio::test]
    async fn test_all_rejected_is_an_error() {
        let bus = Arc::new(LocalBus::new());
        worker(bus.clone(), "w1", Worker::Rejects).await;
        let exchange = exchange(&bus, &[("w1", true)]).await;

        let err = exchange.execute(ExecRequest::new(["build"])).await.err().unwrap();
        match err {
            ExchangeError::Rejected { node_id, reason } => {
                assert_eq!(node_id, NodeId::new("w1"));
                assert_eq!(reason, "not allowed here");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_rejection_completes_future() {
        let bus = Arc::new(LocalBus::new());
        worker(bus.clone(), "w1", Worker::Completes).await;
        worker(bus.clone(), "w2", Worker::Rejects).await;
        let exchange = exchange(&bus, &[("w1", true), ("w2", true)]).await;

        let outcome = exchange.run(ExecRequest::new(["build"])).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.nodes[&NodeId::new("w2")].state,
            TaskState::RequestError
        );
        assert_eq!(outcome.nodes[&NodeId::new("w1")].state, TaskState::Stopped);
    }

    #[tokio::test]
    async fn test_unacknowledged_target_is_not_waited_for() {
        let bus = Arc::new(LocalBus::new());
        worker(bus.clone(), "w1", Worker::Completes).await;
        let exchange = exchange(&bus, &[("w1", true), ("ghost", true)]).await;

        let dispatch = exchange.execute(ExecRequest::new(["build"])).await.unwrap();
        assert_eq!(dispatch.missing, vec![NodeId::new("ghost")]);

        let outcome = dispatch
            .future
            .wait(Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(
            outcome.nodes.keys().cloned().collect::<Vec<_>>(),
            vec![NodeId::new("w1")]
        );
    }

    #[tokio::test]
    async fn test_wait_timeout_reports_pending() {
        let bus = Arc::new(LocalBus::new());
        worker(bus.clone(), "w1", Worker::Hangs).await;
        let exchange = exchange(&bus, &[("w1", true)]).await;

        let dispatch = exchange.execute(ExecRequest::new(["build"])).await.unwrap();
        let err = dispatch
            .future
            .wait(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ExchangeError::FutureTimeout { ref pending } if pending == &vec![NodeId::new("w1")])
        );
        assert_eq!(
            dispatch.future.snapshot()[&NodeId::new("w1")].state,
            TaskState::Enqueue
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals_once() {
        let bus = Arc::new(LocalBus::new());
        worker(bus.clone(), "w1", Worker::Hangs).await;
        let exchange = exchange(&bus, &[("w1", true)]).await;

        let dispatch = exchange.execute(ExecRequest::new(["build"])).await.unwrap();
        let mut completed = dispatch.future.completed();
        assert!(!*completed.borrow_and_update());

        dispatch.future.close();
        dispatch.future.close();

        assert!(completed.has_changed().unwrap());
        assert!(*completed.borrow_and_update());
        assert!(!completed.has_changed().unwrap());
        assert!(matches!(
            dispatch.future.wait(None).await,
            Err(ExchangeError::Closed)
        ));
    }
}
