//! Correlated event envelopes exchanged between nodes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{EventId, NodeId};
use crate::status::{TaskState, Topic};
use crate::task::TaskSpec;

/// A message type that can travel over the event transport.
///
/// Every message carries an [`EventHeader`] used to correlate requests and
/// responses. `KIND` names the message type on the wire.
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn header(&self) -> &EventHeader;

    fn header_mut(&mut self) -> &mut EventHeader;
}

/// Structured error detail attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub code: String,
    pub message: String,
}

impl EventError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Correlation fields shared by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Unique per send.
    pub id: EventId,

    pub created_at: DateTime<Utc>,

    /// Sender.
    pub node_id: NodeId,

    /// Intended recipients. The sender uses its own copy as the outstanding set.
    #[serde(default)]
    pub target_ids: Vec<NodeId>,

    /// Request this event answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_event_id: Option<EventId>,

    /// Responder-side identifier, e.g. the runner created for a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
}

impl Default for EventHeader {
    fn default() -> Self {
        Self {
            id: EventId::default(),
            created_at: Utc::now(),
            node_id: NodeId::default(),
            target_ids: Vec::new(),
            req_event_id: None,
            resp_id: None,
            error: None,
        }
    }
}

impl EventHeader {
    /// Assign a fresh id, the sender and the recipients.
    pub fn stamp(&mut self, sender: &NodeId, targets: Vec<NodeId>) {
        self.id = EventId::generate();
        self.created_at = Utc::now();
        self.node_id = sender.clone();
        self.target_ids = targets;
    }

    /// Header for a response from `responder` to `request`.
    pub fn reply_to(request: &EventHeader, responder: &NodeId) -> Self {
        Self {
            id: EventId::generate(),
            created_at: Utc::now(),
            node_id: responder.clone(),
            target_ids: vec![request.node_id.clone()],
            req_event_id: Some(request.id.clone()),
            resp_id: None,
            error: None,
        }
    }

    pub fn is_addressed_to(&self, node: &NodeId) -> bool {
        self.target_ids.iter().any(|t| t == node)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Task execution request and state-change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(flatten)]
    pub header: EventHeader,

    #[serde(default)]
    pub task_spec: Vec<TaskSpec>,

    #[serde(default)]
    pub parameters: Map<String, Value>,

    pub state: TaskState,

    #[serde(default)]
    pub topic: Topic,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskEvent {
    /// Create an execution request for the given tasks.
    pub fn request(task_spec: Vec<TaskSpec>, parameters: Map<String, Value>) -> Self {
        Self {
            header: EventHeader::default(),
            task_spec,
            parameters,
            state: TaskState::Proposed,
            topic: Topic::Data,
            data: None,
        }
    }

    /// Create a state-change event answering `request`.
    pub fn reply(request: &TaskEvent, responder: &NodeId, state: TaskState) -> Self {
        Self {
            header: EventHeader::reply_to(&request.header, responder),
            task_spec: request.task_spec.clone(),
            parameters: Map::new(),
            state,
            topic: Topic::Data,
            data: None,
        }
    }

    /// Builder method to attach a payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Builder method to attach an error.
    pub fn with_error(mut self, error: EventError) -> Self {
        self.header.error = Some(error);
        self
    }

    /// Builder method to switch topic.
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    /// Names of the requested tasks.
    pub fn task_names(&self) -> Vec<&str> {
        self.task_spec.iter().map(|s| s.name.as_str()).collect()
    }
}

impl Message for TaskEvent {
    const KIND: &'static str = "task";

    fn header(&self) -> &EventHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EventHeader {
        &mut self.header
    }
}

/// Ask nodes which tasks they can run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    #[serde(flatten)]
    pub header: EventHeader,

    /// Optional glob restricting task names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Message for TaskQuery {
    const KIND: &'static str = "task_query";

    fn header(&self) -> &EventHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EventHeader {
        &mut self.header
    }
}

/// Answer to a [`TaskQuery`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskListing {
    #[serde(flatten)]
    pub header: EventHeader,

    #[serde(default)]
    pub items: Vec<Value>,

    #[serde(default)]
    pub total: u64,
}

impl Message for TaskListing {
    const KIND: &'static str = "task_listing";

    fn header(&self) -> &EventHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EventHeader {
        &mut self.header
    }
}

/// Capability announcement of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    #[serde(flatten)]
    pub header: EventHeader,

    pub has_worker: bool,

    #[serde(default)]
    pub tasks: Vec<String>,

    /// The node withdraws the listed tasks.
    #[serde(default)]
    pub withdrawn: bool,
}

impl Message for NodeAnnouncement {
    const KIND: &'static str = "node_announcement";

    fn header(&self) -> &EventHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EventHeader {
        &mut self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_targets_requester() {
        let mut request = TaskEvent::request(vec![TaskSpec::new("a")], Map::new());
        request
            .header
            .stamp(&NodeId::new("origin"), vec![NodeId::new("w1")]);

        let reply = TaskEvent::reply(&request, &NodeId::new("w1"), TaskState::Enqueue);

        assert_eq!(reply.header.node_id, NodeId::new("w1"));
        assert_eq!(reply.header.req_event_id.as_ref(), Some(&request.header.id));
        assert!(reply.header.is_addressed_to(&NodeId::new("origin")));
        assert_ne!(reply.header.id, request.header.id);
    }

    #[test]
    fn test_header_is_flattened_on_the_wire() {
        let mut event = TaskEvent::request(vec![TaskSpec::new("a")], Map::new());
        event.header.stamp(&NodeId::new("n1"), vec![]);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["node_id"], "n1");
        assert_eq!(value["state"], "proposed");

        let back: TaskEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
