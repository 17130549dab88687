//! Request/response correlation across nodes.
//!
//! A [`Correlator`] stamps a request with a fresh id and a target set,
//! publishes it and waits for exactly one response from every target or for
//! the timeout. Accepted responses are handed to a [`Collector`] which turns
//! them into the caller's output.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use taskmesh_core::{EventHeader, EventId, Message, NodeId, TaskListing};

use crate::bus::{publish_message, request_topic, response_topic, BusError, Transport};
use crate::config::RuntimeConfig;
use crate::membership::Membership;

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("Request {request_id} timed out waiting for {missing:?}")]
    Timeout {
        request_id: EventId,
        missing: Vec<NodeId>,
    },

    #[error("No target nodes for request")]
    NoTargets,

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// What a timed-out round returns when some targets answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Return the partial outcome with `missing` filled in.
    #[default]
    AllowPartial,
    /// Any missing target fails the round.
    RequireAll,
}

#[derive(Debug, Clone)]
pub struct CorrelationOptions {
    pub timeout: Duration,
    /// Drop error responses before collecting.
    pub drop_errors: bool,
    pub policy: CompletionPolicy,
}

impl Default for CorrelationOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            drop_errors: false,
            policy: CompletionPolicy::AllowPartial,
        }
    }
}

impl From<&RuntimeConfig> for CorrelationOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            timeout: config.correlation_timeout(),
            drop_errors: config.drop_error_responses,
            policy: if config.require_all_responses {
                CompletionPolicy::RequireAll
            } else {
                CompletionPolicy::AllowPartial
            },
        }
    }
}

/// Aggregates the accepted responses of one round.
pub trait Collector<R: Message>: Send {
    type Output: Send;

    /// Count the responder as answered but leave the response out.
    fn skip(&self, _response: &R) -> bool {
        false
    }

    fn collect(self, responses: Vec<R>) -> Self::Output;
}

/// Result of a correlation round.
#[derive(Debug, Clone)]
pub struct CorrelationOutcome<T> {
    pub request_id: EventId,
    pub output: T,
    /// Targets that answered, in arrival order.
    pub responded: Vec<NodeId>,
    /// Targets that never answered. Empty unless the round timed out.
    pub missing: Vec<NodeId>,
}

impl<T> CorrelationOutcome<T> {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Sends correlated requests for the local node.
#[derive(Clone)]
pub struct Correlator {
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    options: CorrelationOptions,
}

impl Correlator {
    pub fn new(
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
        options: CorrelationOptions,
    ) -> Self {
        Self {
            transport,
            membership,
            options,
        }
    }

    pub fn options(&self) -> &CorrelationOptions {
        &self.options
    }

    pub fn local_node(&self) -> &NodeId {
        self.membership.local_node()
    }

    /// Stamp and send `request`, then collect the responses.
    ///
    /// Without explicit `targets` the request goes to every known node.
    pub async fn send<Q, R, C>(
        &self,
        request: Q,
        targets: Option<Vec<NodeId>>,
        collector: C,
    ) -> Result<CorrelationOutcome<C::Output>, CorrelationError>
    where
        Q: Message,
        R: Message,
        C: Collector<R>,
    {
        let request = self.stamp(request, targets).await?;
        self.send_stamped::<Q, R, C>(request, collector).await
    }

    /// Assign a fresh id, the local sender and the target set.
    pub async fn stamp<Q: Message>(
        &self,
        mut request: Q,
        targets: Option<Vec<NodeId>>,
    ) -> Result<Q, CorrelationError> {
        let targets = match targets {
            Some(targets) => targets,
            None => self.membership.known_nodes().await,
        };
        let targets: Vec<NodeId> = targets
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if targets.is_empty() {
            return Err(CorrelationError::NoTargets);
        }

        request
            .header_mut()
            .stamp(self.membership.local_node(), targets);
        Ok(request)
    }

    /// Send a request already carrying its id and targets.
    pub async fn send_stamped<Q, R, C>(
        &self,
        request: Q,
        collector: C,
    ) -> Result<CorrelationOutcome<C::Output>, CorrelationError>
    where
        Q: Message,
        R: Message,
        C: Collector<R>,
    {
        let request_id = request.header().id.clone();
        let mut outstanding: BTreeSet<NodeId> =
            request.header().target_ids.iter().cloned().collect();
        if outstanding.is_empty() {
            return Err(CorrelationError::NoTargets);
        }

        let mut subscription = self.transport.subscribe(&response_topic::<Q>()).await?;
        publish_message(self.transport.as_ref(), &request_topic::<Q>(), &request).await?;
        debug!(
            request_id = %request_id,
            kind = Q::KIND,
            targets = outstanding.len(),
            "Correlated request sent"
        );

        let deadline = Instant::now() + self.options.timeout;
        let mut responses = Vec::new();
        let mut responded = Vec::new();

        while !outstanding.is_empty() {
            let response = match tokio::time::timeout_at(deadline, subscription.recv_message::<R>())
                .await
            {
                Ok(received) => received?,
                Err(_) => break,
            };

            if let Some(reason) = self.rejection(&request_id, &outstanding, response.header()) {
                debug!(
                    request_id = %request_id,
                    from = %response.header().node_id,
                    reason,
                    "Ignoring response"
                );
                continue;
            }

            let from = response.header().node_id.clone();
            outstanding.remove(&from);
            responded.push(from);
            if !collector.skip(&response) {
                responses.push(response);
            }
        }
        drop(subscription);

        let missing: Vec<NodeId> = outstanding.into_iter().collect();
        if !missing.is_empty() {
            warn!(
                request_id = %request_id,
                missing = ?missing,
                received = responded.len(),
                "Correlation timed out"
            );
            let partial = self.options.policy == CompletionPolicy::AllowPartial
                && !responded.is_empty();
            if !partial {
                return Err(CorrelationError::Timeout {
                    request_id,
                    missing,
                });
            }
        }

        if self.options.drop_errors {
            responses.retain(|r: &R| !r.header().is_error());
        }

        Ok(CorrelationOutcome {
            request_id,
            output: collector.collect(responses),
            responded,
            missing,
        })
    }

    fn rejection(
        &self,
        request_id: &EventId,
        outstanding: &BTreeSet<NodeId>,
        header: &EventHeader,
    ) -> Option<&'static str> {
        if header.req_event_id.as_ref() != Some(request_id) {
            return Some("different request");
        }
        if !header.is_addressed_to(self.membership.local_node()) {
            return Some("not addressed to this node");
        }
        if !outstanding.contains(&header.node_id) {
            return Some("responder not outstanding");
        }
        None
    }
}

/// Every accepted response, in arrival order.
pub struct VecCollector;

impl<R: Message> Collector<R> for VecCollector {
    type Output = Vec<R>;

    fn collect(self, responses: Vec<R>) -> Vec<R> {
        responses
    }
}

/// Accepted responses keyed by responding node.
pub struct ByNodeCollector;

impl<R: Message> Collector<R> for ByNodeCollector {
    type Output = BTreeMap<NodeId, R>;

    fn collect(self, responses: Vec<R>) -> Self::Output {
        responses
            .into_iter()
            .map(|r| (r.header().node_id.clone(), r))
            .collect()
    }
}

/// Response carrying a list of items and a count.
pub trait ItemsResponse: Message {
    fn items(&self) -> &[Value];

    fn total(&self) -> u64;
}

impl ItemsResponse for TaskListing {
    fn items(&self) -> &[Value] {
        &self.items
    }

    fn total(&self) -> u64 {
        self.total
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// One array over all nodes.
    #[default]
    Flat,
    /// One array per responding node.
    ByNode,
}

/// Merged items of a round.
#[derive(Debug, Clone, PartialEq)]
pub enum Items {
    Flat(Vec<Value>),
    ByNode(BTreeMap<NodeId, Vec<Value>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemsOutput {
    pub items: Items,
    /// Sum of the totals reported by the responders.
    pub total: u64,
}

/// Concatenates item lists, optionally sorted by an object key.
#[derive(Debug, Clone, Default)]
pub struct ItemsCollector {
    sort_key: Option<String>,
    descending: bool,
    mode: OutputMode,
}

impl ItemsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort_by(mut self, key: impl Into<String>, descending: bool) -> Self {
        self.sort_key = Some(key.into());
        self.descending = descending;
        self
    }

    pub fn mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    fn sort(&self, items: &mut [Value]) {
        let Some(key) = &self.sort_key else {
            return;
        };
        items.sort_by(|a, b| {
            let ord = compare_values(a.get(key), b.get(key));
            if self.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }
}

impl<R: ItemsResponse> Collector<R> for ItemsCollector {
    type Output = ItemsOutput;

    fn collect(self, responses: Vec<R>) -> ItemsOutput {
        let total = responses.iter().map(ItemsResponse::total).sum();
        let items = match self.mode {
            OutputMode::Flat => {
                let mut items: Vec<Value> = responses
                    .iter()
                    .flat_map(|r| r.items().iter().cloned())
                    .collect();
                self.sort(&mut items);
                Items::Flat(items)
            }
            OutputMode::ByNode => {
                let mut by_node: BTreeMap<NodeId, Vec<Value>> = BTreeMap::new();
                for response in &responses {
                    by_node
                        .entry(response.header().node_id.clone())
                        .or_default()
                        .extend(response.items().iter().cloned());
                }
                for items in by_node.values_mut() {
                    self.sort(items);
                }
                Items::ByNode(by_node)
            }
        };
        ItemsOutput { items, total }
    }
}

/// Missing values sort first, then numbers, strings and everything else.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::membership::StaticMembership;
    use serde_json::json;
    use taskmesh_core::{EventError, NodeCapabilities, TaskQuery};

    #[derive(Clone, Copy)]
    struct Behaviour {
        delay_ms: u64,
        duplicate: bool,
        error: bool,
    }

    impl Default for Behaviour {
        fn default() -> Self {
            Self {
                delay_ms: 0,
                duplicate: false,
                error: false,
            }
        }
    }

    /// Answer every query addressed to `node` with one item naming the node.
    async fn responder(bus: Arc<LocalBus>, node: &str, behaviour: Behaviour) {
        let node = NodeId::new(node);
        let mut requests = bus.subscribe(&request_topic::<TaskQuery>()).await.unwrap();
        tokio::spawn(async move {
            while let Ok(query) = requests.recv_message::<TaskQuery>().await {
                if !query.header.is_addressed_to(&node) {
                    continue;
                }
                tokio::time::sleep(Duration::from_millis(behaviour.delay_ms)).await;
                let mut listing = TaskListing {
                    header: EventHeader::reply_to(&query.header, &node),
                    items: vec![json!({"node": node.as_str(), "rank": node.as_str().len()})],
                    total: 1,
                };
                if behaviour.error {
                    listing.header.error = Some(EventError::new("failed", "boom"));
                }
                let repeats = if behaviour.duplicate { 2 } else { 1 };
                for _ in 0..repeats {
                    publish_message(bus.as_ref(), &response_topic::<TaskQuery>(), &listing)
                        .await
                        .unwrap();
                }
            }
        });
    }

    fn correlator(bus: &Arc<LocalBus>, options: CorrelationOptions) -> Correlator {
        let membership = Arc::new(StaticMembership::new(NodeCapabilities::new(
            NodeId::new("origin"),
            false,
        )));
        Correlator::new(bus.clone(), membership, options)
    }

    fn targets(ids: &[&str]) -> Option<Vec<NodeId>> {
        Some(ids.iter().map(|id| NodeId::new(*id)).collect())
    }

    fn quick(policy: CompletionPolicy) -> CorrelationOptions {
        CorrelationOptions {
            timeout: Duration::from_millis(150),
            policy,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_one_response_per_target() {
        let bus = Arc::new(LocalBus::new());
        for node in ["n1", "n2", "n3"] {
            responder(bus.clone(), node, Behaviour::default()).await;
        }

        let outcome = correlator(&bus, CorrelationOptions::default())
            .send::<_, TaskListing, _>(TaskQuery::default(), targets(&["n1", "n2", "n3"]), VecCollector)
            .await
            .unwrap();

        assert!(outcome.is_complete());
        let output: Vec<TaskListing> = outcome.output;
        assert_eq!(output.len(), 3);
        assert_eq!(outcome.responded.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_and_stray_responses_are_ignored() {
        let bus = Arc::new(LocalBus::new());
        responder(
            bus.clone(),
            "n1",
            Behaviour {
                duplicate: true,
                ..Default::default()
            },
        )
        .await;
        responder(
            bus.clone(),
            "n2",
            Behaviour {
                delay_ms: 20,
                ..Default::default()
            },
        )
        .await;

        // Reply from a node outside the target set, for the right request.
        let mut snoop = bus.subscribe(&request_topic::<TaskQuery>()).await.unwrap();
        let stray_bus = bus.clone();
        tokio::spawn(async move {
            if let Ok(query) = snoop.recv_message::<TaskQuery>().await {
                let stray = TaskListing {
                    header: EventHeader::reply_to(&query.header, &NodeId::new("stranger")),
                    items: vec![json!({"node": "stranger"})],
                    total: 1,
                };
                let _ = publish_message(stray_bus.as_ref(), &response_topic::<TaskQuery>(), &stray)
                    .await;
            }
        });

        let outcome = correlator(&bus, CorrelationOptions::default())
            .send::<_, TaskListing, _>(TaskQuery::default(), targets(&["n1", "n2"]), ByNodeCollector)
            .await
            .unwrap();

        let output: BTreeMap<NodeId, TaskListing> = outcome.output;
        assert_eq!(
            output.keys().cloned().collect::<Vec<_>>(),
            vec![NodeId::new("n1"), NodeId::new("n2")]
        );
        assert_eq!(outcome.responded.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_target_yields_partial_outcome() {
        let bus = Arc::new(LocalBus::new());
        responder(bus.clone(), "n1", Behaviour::default()).await;
        responder(bus.clone(), "n2", Behaviour::default()).await;

        let outcome = correlator(&bus, quick(CompletionPolicy::AllowPartial))
            .send::<_, TaskListing, _>(
                TaskQuery::default(),
                targets(&["n1", "n2", "ghost"]),
                VecCollector,
            )
            .await
            .unwrap();

        assert!(!outcome.is_complete());
        let CorrelationOutcome { output, missing, .. } = outcome;
        let output: Vec<TaskListing> = output;
        assert_eq!(output.len(), 2);
        assert_eq!(missing, vec![NodeId::new("ghost")]);
    }

    #[tokio::test]
    async fn test_require_all_fails_on_missing_target() {
        let bus = Arc::new(LocalBus::new());
        responder(bus.clone(), "n1", Behaviour::default()).await;

        let result = correlator(&bus, quick(CompletionPolicy::RequireAll))
            .send::<_, TaskListing, _>(TaskQuery::default(), targets(&["n1", "ghost"]), VecCollector)
            .await;

        match result {
            Err(CorrelationError::Timeout { missing, .. }) => {
                assert_eq!(missing, vec![NodeId::new("ghost")]);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_response_at_all_is_an_error() {
        let bus = Arc::new(LocalBus::new());
        let result = correlator(&bus, quick(CompletionPolicy::AllowPartial))
            .send::<_, TaskListing, _>(TaskQuery::default(), targets(&["ghost"]), VecCollector)
            .await;
        assert!(matches!(result, Err(CorrelationError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_empty_target_list() {
        let bus = Arc::new(LocalBus::new());
        let result = correlator(&bus, CorrelationOptions::default())
            .send::<_, TaskListing, _>(TaskQuery::default(), Some(vec![]), VecCollector)
            .await;
        assert!(matches!(result, Err(CorrelationError::NoTargets)));
    }

    #[tokio::test]
    async fn test_default_targets_are_known_nodes() {
        let bus = Arc::new(LocalBus::new());
        responder(bus.clone(), "origin", Behaviour::default()).await;

        let outcome = correlator(&bus, CorrelationOptions::default())
            .send::<_, TaskListing, _>(TaskQuery::default(), None, VecCollector)
            .await
            .unwrap();
        let output: Vec<TaskListing> = outcome.output;
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].header.node_id, NodeId::new("origin"));
    }

    #[tokio::test]
    async fn test_drop_errors_filters_error_responses() {
        let bus = Arc::new(LocalBus::new());
        responder(bus.clone(), "n1", Behaviour::default()).await;
        responder(
            bus.clone(),
            "n2",
            Behaviour {
                error: true,
                ..Default::default()
            },
        )
        .await;

        let options = CorrelationOptions {
            drop_errors: true,
            ..Default::default()
        };
        let outcome = correlator(&bus, options)
            .send::<_, TaskListing, _>(TaskQuery::default(), targets(&["n1", "n2"]), VecCollector)
            .await
            .unwrap();

        let output: Vec<TaskListing> = outcome.output;
        assert_eq!(output.len(), 1);
        assert_eq!(outcome.responded.len(), 2);
    }

    #[tokio::test]
    async fn test_items_collector_sorts_and_groups() {
        let bus = Arc::new(LocalBus::new());
        for node in ["a", "ccc", "bb"] {
            responder(bus.clone(), node, Behaviour::default()).await;
        }
        let correlator = correlator(&bus, CorrelationOptions::default());

        let flat = correlator
            .send::<_, TaskListing, _>(
                TaskQuery::default(),
                targets(&["a", "bb", "ccc"]),
                ItemsCollector::new().sort_by("rank", true),
            )
            .await
            .unwrap()
            .output;
        assert_eq!(flat.total, 3);
        let Items::Flat(items) = flat.items else {
            panic!("expected flat items");
        };
        let ranks: Vec<u64> = items.iter().filter_map(|i| i["rank"].as_u64()).collect();
        assert_eq!(ranks, vec![3, 2, 1]);

        let grouped = correlator
            .send::<_, TaskListing, _>(
                TaskQuery::default(),
                targets(&["a", "bb"]),
                ItemsCollector::new().mode(OutputMode::ByNode),
            )
            .await
            .unwrap()
            .output;
        let Items::ByNode(by_node) = grouped.items else {
            panic!("expected items by node");
        };
        assert_eq!(by_node.len(), 2);
        assert_eq!(by_node[&NodeId::new("bb")][0]["node"], "bb");
    }

    #[test]
    fn test_compare_values_mixed_types() {
        let mut values = vec![json!("b"), json!(2), Value::Null, json!("a"), json!(1.5)];
        values.sort_by(|a, b| compare_values(Some(a), Some(b)));
        assert_eq!(values, vec![Value::Null, json!(1.5), json!(2), json!("a"), json!("b")]);
    }
}
