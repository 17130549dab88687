//! TaskMesh runtime.
//!
//! Executes declared tasks locally through a dependency-graph runner and
//! across nodes through a correlated request/response protocol:
//!
//! - [`queue`]: bounded-concurrency job queue
//! - [`graph`]: task graph registry with access rules
//! - [`runner`]: dependency-graph runner and its per-task state machine
//! - [`bus`], [`membership`]: transport and cluster collaborators
//! - [`correlation`], [`exchange`]: request correlation and remote execution
//! - [`node`]: request handling on worker nodes

pub mod bus;
pub mod config;
pub mod context;
pub mod correlation;
pub mod exchange;
pub mod graph;
pub mod membership;
pub mod node;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod task;
pub mod tasklog;

/// Error type returned by task bodies and job processors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use bus::{BusError, Envelope, LocalBus, Subscription, Transport};
pub use config::RuntimeConfig;
pub use context::NodeContext;
pub use correlation::{
    Collector, CompletionPolicy, CorrelationError, CorrelationOptions, CorrelationOutcome,
    Correlator, Items, ItemsCollector, ItemsOutput, OutputMode,
};
pub use exchange::{
    Dispatch, DispatchAck, ExchangeError, ExecRequest, FutureOutcome, TaskExchange, TaskFuture,
};
pub use graph::{AccessPolicy, AccessRule, TaskGraph};
pub use membership::{Membership, StaticMembership};
pub use node::NodeService;
pub use queue::{JobHandle, JobProcessor, JobQueue, QueueError, QueueStatus};
pub use registry::{RunnerInfo, RunnerRegistry};
pub use runner::{RunnerError, RunnerUpdate, TaskContext, TaskRunner, UpdateKind};
pub use task::{Done, PropertyDef, TaskDef, TaskExecutable, TaskRef};
pub use tasklog::{KeyedLock, MemoryTaskLog, TaskLogStore};
