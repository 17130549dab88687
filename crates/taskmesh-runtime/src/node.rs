//! Node service: answers task requests, queries and announcements arriving
//! over the transport.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskmesh_core::{
    EventError, EventHeader, NodeAnnouncement, TaskEvent, TaskListing, TaskQuery, TaskState,
    Topic,
};

use crate::bus::{
    broadcast_topic, publish_message, request_topic, response_topic, BusError, Subscription,
    Transport,
};
use crate::context::NodeContext;
use crate::queue::{JobProcessor, JobQueue};
use crate::runner::{TaskRunner, UpdateKind};
use crate::BoxError;

/// Accepted request waiting for a queue slot.
pub struct TaskJob {
    request: TaskEvent,
    runner: TaskRunner,
}

/// Runs accepted requests and reports their progress to the requester.
struct RequestProcessor {
    ctx: Arc<NodeContext>,
}

impl RequestProcessor {
    async fn reply(&self, event: TaskEvent) {
        if let Err(e) =
            publish_message(self.ctx.transport().as_ref(), &response_topic::<TaskEvent>(), &event)
                .await
        {
            warn!(node_id = %self.ctx.node_id(), error = %e, "Failed to publish task event");
        }
    }
}

#[async_trait]
impl JobProcessor<TaskJob> for RequestProcessor {
    async fn process(&self, job: TaskJob) -> Result<(), BoxError> {
        let TaskJob { request, runner } = job;
        let node = self.ctx.node_id().clone();
        let runner_id = runner.id().to_string();
        let event = |state: TaskState| {
            let mut event = TaskEvent::reply(&request, &node, state);
            event.header.resp_id = Some(runner_id.clone());
            event
        };

        self.reply(event(TaskState::Started)).await;

        // Forward progress and log lines until the runner finishes.
        let mut updates = runner.subscribe();
        let forward = {
            let started = event(TaskState::Running);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let topic = response_topic::<TaskEvent>();
                loop {
                    let update = match updates.recv().await {
                        Ok(update) => update,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(
                                node_id = %ctx.node_id(),
                                skipped = n,
                                "Progress forwarder lagged, skipping updates"
                            );
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    let event = match update.kind {
                        UpdateKind::Progress { progress, total } => started.clone().with_data(json!({
                            "task": update.task,
                            "progress": progress,
                            "total": total,
                        })),
                        UpdateKind::Log(line) => started
                            .clone()
                            .with_topic(Topic::Log)
                            .with_data(json!(format!("[{}] {}", update.task, line))),
                        _ => continue,
                    };
                    if let Err(e) = publish_message(ctx.transport().as_ref(), &topic, &event).await {
                        warn!(node_id = %ctx.node_id(), error = %e, "Failed to publish task event");
                    }
                }
            })
        };

        let outcome = runner.run().await;
        let _ = forward.await;

        match outcome {
            Ok(result) => {
                let run_id = request.header.id.to_string();
                if let Err(e) = self.ctx.task_log().save(&run_id, &result).await {
                    warn!(run_id = %run_id, error = %e, "Failed to save task log");
                }
                let data = serde_json::to_value(&result)?;
                self.reply(event(TaskState::Stopped).with_data(data)).await;
                Ok(())
            }
            Err(e) => {
                error!(node_id = %node, request_id = %request.header.id, error = %e, "Runner failed");
                self.reply(
                    event(TaskState::Errored).with_error(EventError::new("runner", e.to_string())),
                )
                .await;
                Err(e.into())
            }
        }
    }

    async fn on_drained(&self) {
        debug!(node_id = %self.ctx.node_id(), "Request queue drained");
    }
}

/// Transport-facing side of a node.
pub struct NodeService {
    ctx: Arc<NodeContext>,
    queue: JobQueue<TaskJob>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeService {
    /// Subscribe to requests, queries and announcements.
    pub async fn start(ctx: Arc<NodeContext>) -> Result<Arc<Self>, BusError> {
        let processor = Arc::new(RequestProcessor { ctx: ctx.clone() });
        let queue = JobQueue::new(
            format!("{}-requests", ctx.node_id()),
            ctx.config().queue_concurrency,
            processor,
        );

        let transport = ctx.transport().clone();
        let requests = transport.subscribe(&request_topic::<TaskEvent>()).await?;
        let queries = transport.subscribe(&request_topic::<TaskQuery>()).await?;
        let announcements = transport
            .subscribe(&broadcast_topic::<NodeAnnouncement>())
            .await?;

        let service = Arc::new(Self {
            ctx,
            queue,
            loops: Mutex::new(Vec::new()),
        });

        let loops = vec![
            tokio::spawn(service.clone().request_loop(requests)),
            tokio::spawn(service.clone().query_loop(queries)),
            tokio::spawn(service.clone().announcement_loop(announcements)),
        ];
        service
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loops);

        info!(
            node_id = %service.ctx.node_id(),
            worker = service.ctx.has_worker(),
            "Node service started"
        );
        Ok(service)
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn queue(&self) -> &JobQueue<TaskJob> {
        &self.queue
    }

    /// Publish the local task list.
    pub async fn announce(&self) -> Result<(), BusError> {
        let tasks = self.ctx.graph().read().await.local_names();
        self.publish_announcement(tasks, false).await
    }

    /// Tell other nodes the given tasks are gone.
    pub async fn withdraw(&self, tasks: Vec<String>) -> Result<(), BusError> {
        self.publish_announcement(tasks, true).await
    }

    /// Withdraw local tasks, stop listening and drain the queue.
    pub async fn shutdown(&self) {
        let tasks = self.ctx.graph().read().await.local_names();
        if let Err(e) = self.withdraw(tasks).await {
            debug!(error = %e, "Withdrawal not published");
        }
        for handle in self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        self.queue.shutdown(true).await;
        info!(node_id = %self.ctx.node_id(), "Node service stopped");
    }

    async fn publish_announcement(&self, tasks: Vec<String>, withdrawn: bool) -> Result<(), BusError> {
        let mut announcement = NodeAnnouncement {
            has_worker: self.ctx.has_worker(),
            tasks,
            withdrawn,
            ..Default::default()
        };
        announcement.header.stamp(self.ctx.node_id(), Vec::new());
        publish_message(
            self.ctx.transport().as_ref(),
            &broadcast_topic::<NodeAnnouncement>(),
            &announcement,
        )
        .await
    }

    async fn request_loop(self: Arc<Self>, mut requests: Subscription) {
        while let Ok(request) = requests.recv_message::<TaskEvent>().await {
            if request.header.is_addressed_to(self.ctx.node_id()) {
                self.handle_request(request).await;
            }
        }
    }

    async fn handle_request(&self, request: TaskEvent) {
        let node = self.ctx.node_id().clone();
        let names: Vec<String> = request.task_names().iter().map(|n| n.to_string()).collect();

        let runner = match self.accept(&request).await {
            Ok(runner) => runner,
            Err(rejection) => {
                warn!(
                    node_id = %node,
                    request_id = %request.header.id,
                    tasks = ?names,
                    code = %rejection.code,
                    reason = %rejection.message,
                    "Rejecting task request"
                );
                self.publish_reply(
                    TaskEvent::reply(&request, &node, TaskState::RequestError).with_error(rejection),
                )
                .await;
                return;
            }
        };

        let mut ack = TaskEvent::reply(&request, &node, TaskState::Enqueue);
        ack.header.resp_id = Some(runner.id().to_string());
        self.publish_reply(ack).await;
        debug!(node_id = %node, request_id = %request.header.id, tasks = ?names, "Task request enqueued");

        let failed = TaskEvent::reply(&request, &node, TaskState::Errored);
        if let Err(e) = self.queue.push(TaskJob { request, runner }) {
            self.publish_reply(failed.with_error(EventError::new("shut_down", e.to_string())))
                .await;
        }
    }

    /// Check access and parameters, returning a validated runner.
    async fn accept(&self, request: &TaskEvent) -> Result<TaskRunner, EventError> {
        if !self.ctx.has_worker() {
            return Err(EventError::new("not_a_worker", "node does not run a worker"));
        }
        if request.task_spec.is_empty() {
            return Err(EventError::new("invalid_request", "no tasks requested"));
        }

        {
            let graph = self.ctx.graph().read().await;
            for name in request.task_names() {
                if !graph.access(name) {
                    return Err(EventError::new(
                        "access_denied",
                        format!("access to task '{name}' is denied"),
                    ));
                }
                let task = graph
                    .resolve(name)
                    .map_err(|e| EventError::new("definition", e.to_string()))?;
                if !task.is_local() {
                    return Err(EventError::new(
                        "not_local",
                        format!("task '{name}' is not available on this node"),
                    ));
                }
            }
        }

        let runner = self
            .ctx
            .runner()
            .tasks(request.task_spec.clone())
            .incoming(request.parameters.clone())
            .build()
            .await
            .map_err(|e| EventError::new("definition", e.to_string()))?;
        runner
            .validate()
            .map_err(|e| EventError::new("validation", e.to_string()))?;
        Ok(runner)
    }

    async fn publish_reply(&self, event: TaskEvent) {
        if let Err(e) =
            publish_message(self.ctx.transport().as_ref(), &response_topic::<TaskEvent>(), &event)
                .await
        {
            warn!(node_id = %self.ctx.node_id(), error = %e, "Failed to publish reply");
        }
    }

    async fn query_loop(self: Arc<Self>, mut queries: Subscription) {
        while let Ok(query) = queries.recv_message::<TaskQuery>().await {
            if !query.header.is_addressed_to(self.ctx.node_id()) {
                continue;
            }
            let listing = self.listing(&query).await;
            if let Err(e) = publish_message(
                self.ctx.transport().as_ref(),
                &response_topic::<TaskQuery>(),
                &listing,
            )
            .await
            {
                warn!(node_id = %self.ctx.node_id(), error = %e, "Failed to answer task query");
            }
        }
    }

    async fn listing(&self, query: &TaskQuery) -> TaskListing {
        let node = self.ctx.node_id();
        let pattern = query
            .pattern
            .as_deref()
            .and_then(|p| glob::Pattern::new(p).ok());

        let graph = self.ctx.graph().read().await;
        let items: Vec<_> = graph
            .local_names()
            .into_iter()
            .filter(|name| pattern.as_ref().map_or(true, |p| p.matches(name)))
            .filter_map(|name| graph.resolve(&name).ok())
            .map(|task| {
                json!({
                    "name": task.name(),
                    "node_id": node.as_str(),
                    "variant": task.variant(),
                    "description": task.description(),
                })
            })
            .collect();

        TaskListing {
            header: EventHeader::reply_to(&query.header, node),
            total: items.len() as u64,
            items,
        }
    }

    async fn announcement_loop(self: Arc<Self>, mut announcements: Subscription) {
        while let Ok(announcement) = announcements.recv_message::<NodeAnnouncement>().await {
            let from = announcement.header.node_id.clone();
            if &from == self.ctx.node_id() {
                continue;
            }

            self.ctx.membership().apply(&announcement).await;
            let mut graph = self.ctx.graph().write().await;
            for task in &announcement.tasks {
                if announcement.withdrawn {
                    graph.withdraw_remote(task, &from);
                } else {
                    graph.add_remote(task, &from, announcement.has_worker);
                }
            }
            debug!(
                node_id = %self.ctx.node_id(),
                from = %from,
                tasks = announcement.tasks.len(),
                withdrawn = announcement.withdrawn,
                "Processed node announcement"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::RuntimeConfig;
    use crate::correlation::{Items, OutputMode};
    use crate::exchange::{ExchangeError, ExecRequest};
    use crate::graph::AccessRule;
    use crate::membership::Membership;
    use crate::task::{PropertyDef, TaskDef};
    use serde_json::{Map, Value};
    use std::time::Duration;
    use taskmesh_core::{NodeId, TaskRunStatus};

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            correlation_timeout_ms: 500,
            ..Default::default()
        }
    }

    async fn node(bus: &Arc<LocalBus>, id: &str, worker: bool) -> Arc<NodeService> {
        let transport: Arc<dyn Transport> = bus.clone();
        let ctx = NodeContext::builder(NodeId::new(id), transport)
            .config(config())
            .worker(worker)
            .build();
        NodeService::start(ctx).await.unwrap()
    }

    async fn register_pipeline(service: &NodeService) {
        let ctx = service.context();
        ctx.register(
            TaskDef::new("fetch")
                .outgoing(PropertyDef::required("rows"))
                .exec(|ctx| async move {
                    ctx.log("fetching");
                    Ok(json!({"rows": 3}))
                }),
        )
        .await
        .unwrap();
        ctx.register(
            TaskDef::new("report")
                .depends_on("fetch")
                .incoming(PropertyDef::required("rows"))
                .exec(|ctx| async move {
                    ctx.total(1);
                    ctx.progress(1);
                    Ok(json!({"rows": ctx.get("rows").cloned().unwrap_or(Value::Null)}))
                }),
        )
        .await
        .unwrap();
    }

    /// Announce every node to every other node.
    async fn announce_all(services: &[&Arc<NodeService>]) {
        for service in services {
            service.announce().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_distributed_run_across_nodes() {
        let bus = Arc::new(LocalBus::new());
        let origin = node(&bus, "origin", false).await;
        let w1 = node(&bus, "w1", true).await;
        let w2 = node(&bus, "w2", true).await;
        register_pipeline(&w1).await;
        register_pipeline(&w2).await;
        announce_all(&[&origin, &w1, &w2]).await;

        let exchange = origin.context().exchange().clone();
        let dispatch = exchange.execute(ExecRequest::new(["report"])).await.unwrap();
        assert_eq!(dispatch.ack.accepted.len(), 2);

        let outcome = dispatch
            .future
            .wait(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(outcome.is_success());

        for worker in ["w1", "w2"] {
            let progress = &outcome.nodes[&NodeId::new(worker)];
            let result = progress.runner_result().unwrap();
            assert_eq!(result.task_names, vec!["fetch", "report"]);
            assert_eq!(result.outgoing.get("rows"), Some(&json!(3)));
            assert!(progress.logs.iter().any(|l| l.contains("fetching")));
        }

        // Each worker logged its own run under the request id.
        let rows = w1
            .context()
            .task_log()
            .rows(&dispatch.request_id.to_string())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == TaskRunStatus::Done));
    }

    #[tokio::test]
    async fn test_update_burst_keeps_forwarding() {
        let bus = Arc::new(LocalBus::with_capacity(8192));
        let origin = node(&bus, "origin", false).await;
        let w1 = node(&bus, "w1", true).await;
        let w2 = node(&bus, "w2", true).await;
        for worker in [&w1, &w2] {
            worker
                .context()
                .register(TaskDef::new("burst").exec(|ctx| async move {
                    ctx.total(2000);
                    for i in 1..=2000 {
                        ctx.progress(i);
                    }
                    ctx.log("final line");
                    Ok(json!(null))
                }))
                .await
                .unwrap();
        }
        announce_all(&[&origin, &w1, &w2]).await;

        let outcome = origin
            .context()
            .exchange()
            .run(ExecRequest::new(["burst"]))
            .await
            .unwrap();

        assert!(outcome.is_success());
        for worker in ["w1", "w2"] {
            let progress = &outcome.nodes[&NodeId::new(worker)];
            assert!(
                progress.logs.iter().any(|l| l.contains("final line")),
                "{worker} logs: {:?}",
                progress.logs
            );
        }
    }

    #[tokio::test]
    async fn test_announcements_register_remote_tasks() {
        let bus = Arc::new(LocalBus::new());
        let origin = node(&bus, "origin", false).await;
        let w1 = node(&bus, "w1", true).await;
        register_pipeline(&w1).await;
        announce_all(&[&w1]).await;

        {
            let graph = origin.context().graph().read().await;
            let fetch = graph.resolve("fetch").unwrap();
            assert!(!fetch.is_local());
            assert_eq!(fetch.worker_nodes(), vec![NodeId::new("w1")]);
        }
        let workers = origin.context().membership().worker_nodes().await;
        assert!(workers.contains(&NodeId::new("w1")));

        w1.withdraw(vec!["fetch".to_string()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!origin.context().graph().read().await.contains("fetch"));
    }

    #[tokio::test]
    async fn test_access_denied_is_rejected() {
        let bus = Arc::new(LocalBus::new());
        let origin = node(&bus, "origin", false).await;
        let w1 = node(&bus, "w1", true).await;
        register_pipeline(&w1).await;
        w1.context()
            .graph()
            .write()
            .await
            .set_rules(vec![AccessRule::deny("*").unwrap()]);
        announce_all(&[&w1]).await;

        let err = origin
            .context()
            .exchange()
            .execute(ExecRequest::new(["report"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExchangeError::Rejected { ref node_id, .. } if node_id == &NodeId::new("w1")));
    }

    #[tokio::test]
    async fn test_missing_parameter_is_rejected() {
        let bus = Arc::new(LocalBus::new());
        let origin = node(&bus, "origin", false).await;
        let w1 = node(&bus, "w1", true).await;
        w1.context()
            .register(
                TaskDef::new("greet")
                    .incoming(PropertyDef::required("who"))
                    .exec(|_ctx| async { Ok(json!(null)) }),
            )
            .await
            .unwrap();
        announce_all(&[&w1]).await;

        let exchange = origin.context().exchange();
        let err = exchange
            .execute(ExecRequest::new(["greet"]))
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, ExchangeError::Rejected { ref reason, .. } if reason.contains("who"))
        );

        let outcome = exchange
            .run(ExecRequest::new(["greet"]).with_parameter("who", json!("world")))
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_runner_failure_publishes_errored() {
        let bus = Arc::new(LocalBus::new());
        let origin = node(&bus, "origin", false).await;
        let w1 = node(&bus, "w1", true).await;
        let ctx = w1.context();
        ctx.register(TaskDef::new("x").depends_on("y").exec(|_ctx| async { Ok(json!(null)) }))
            .await
            .unwrap();
        ctx.register(TaskDef::new("y").depends_on("x").exec(|_ctx| async { Ok(json!(null)) }))
            .await
            .unwrap();
        announce_all(&[&w1]).await;

        let outcome = origin
            .context()
            .exchange()
            .run(ExecRequest::new(["x"]))
            .await
            .unwrap();
        let progress = &outcome.nodes[&NodeId::new("w1")];
        assert_eq!(progress.state, TaskState::Errored);
        assert!(progress
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("Deadlock"));
    }

    #[tokio::test]
    async fn test_list_remote_tasks() {
        let bus = Arc::new(LocalBus::new());
        let origin = node(&bus, "origin", false).await;
        let w1 = node(&bus, "w1", true).await;
        register_pipeline(&w1).await;
        announce_all(&[&origin, &w1]).await;

        let outcome = origin
            .context()
            .exchange()
            .list_remote_tasks(Some("f*".to_string()), OutputMode::Flat)
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.output.total, 1);
        let Items::Flat(items) = outcome.output.items else {
            panic!("expected flat listing");
        };
        assert_eq!(items[0]["name"], "fetch");
        assert_eq!(items[0]["node_id"], "w1");
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let bus = Arc::new(LocalBus::new());
        let w1 = node(&bus, "w1", true).await;
        w1.shutdown().await;
        assert!(w1.queue().status().paused);

        let runner = w1
            .context()
            .runner()
            .tasks(Vec::<String>::new())
            .build()
            .await
            .unwrap();
        let pushed = w1.queue().push(TaskJob {
            request: TaskEvent::request(vec![], Map::new()),
            runner,
        });
        assert!(pushed.is_err());
    }
}
