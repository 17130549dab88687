//! TaskMesh Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network transports
//! - Async runtimes
//! - Storage backends
//!
//! Everything here is shared between the local task runner and the
//! node-to-node correlation protocol.

pub mod error;
pub mod event;
pub mod ids;
pub mod node;
pub mod result;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use event::{EventError, EventHeader, Message, NodeAnnouncement, TaskEvent, TaskListing, TaskQuery};
pub use ids::{EventId, NodeId, RunnerId};
pub use node::NodeCapabilities;
pub use result::{RunnerStats, TaskRunnerResult, TaskStatusEntry};
pub use status::{RunnerState, TaskRunStatus, TaskState, Topic};
pub use task::{NodeInfo, PropertySpec, TaskSpec, TaskVariant};
