//! Bounded-concurrency job queue.
//!
//! Jobs are started in FIFO order while fewer than `concurrent` jobs are
//! running. Every state change (push, completion, resume) drives the queue
//! forward through [`QueueInner::pump`]; there is no background loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::BoxError;

/// Queue errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue '{0}' is shut down")]
    ShutDown(String),
}

/// Work performed for every job of a queue.
#[async_trait]
pub trait JobProcessor<T: Send + 'static>: Send + Sync + 'static {
    /// Process one workload. An error fails the job but not the queue.
    async fn process(&self, workload: T) -> Result<(), BoxError>;

    /// Called whenever the queue runs empty after processing.
    async fn on_drained(&self) {}
}

/// Lifecycle of a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Enqueued,
    Started,
    Stopped { error: Option<String> },
}

impl JobState {
    fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

/// Observer for the lifecycle of a pushed job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u64,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state of the job.
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Resolves once the job has left the queue and started (or was finalized).
    pub async fn started(&mut self) {
        let _ = self
            .state
            .wait_for(|s| !matches!(s, JobState::Enqueued))
            .await;
    }

    /// Resolves once the job stopped, yielding its error if it failed.
    pub async fn stopped(&mut self) -> Option<String> {
        match self.state.wait_for(JobState::is_stopped).await {
            Ok(state) => match &*state {
                JobState::Stopped { error } => error.clone(),
                _ => None,
            },
            Err(_) => Some("job dropped".to_string()),
        }
    }
}

/// A queued unit of work. Owned by the queue until it stops.
struct QueueJob<T> {
    id: u64,
    workload: T,
    state: watch::Sender<JobState>,
}

impl<T> QueueJob<T> {
    /// Stop a job that never ran and release its observers.
    fn finalize(self, reason: &str) {
        if !self.state.borrow().is_stopped() {
            self.state.send_replace(JobState::Stopped {
                error: Some(reason.to_string()),
            });
        }
    }
}

/// Counts snapshot of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub enqueued: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub paused: bool,
}

impl QueueStatus {
    /// Jobs not yet finished.
    pub fn active(&self) -> usize {
        self.enqueued + self.running
    }
}

struct QueueState<T: Send + 'static> {
    pending: VecDeque<QueueJob<T>>,
    running: usize,
    done: usize,
    failed: usize,
    paused: bool,
    shut_down: bool,
    next_id: u64,
    processor: Option<Arc<dyn JobProcessor<T>>>,
}

impl<T: Send + 'static> QueueState<T> {
    fn status(&self) -> QueueStatus {
        QueueStatus {
            enqueued: self.pending.len(),
            running: self.running,
            done: self.done,
            failed: self.failed,
            paused: self.paused,
        }
    }
}

struct QueueInner<T: Send + 'static> {
    name: String,
    concurrent: usize,
    state: Mutex<QueueState<T>>,
    status_tx: watch::Sender<QueueStatus>,
}

/// Bounded-concurrency executor for homogeneous workloads.
pub struct JobQueue<T: Send + 'static> {
    inner: Arc<QueueInner<T>>,
}

impl<T: Send + 'static> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> JobQueue<T> {
    /// Create a queue running at most `concurrent` jobs at once (minimum 1).
    pub fn new(
        name: impl Into<String>,
        concurrent: usize,
        processor: Arc<dyn JobProcessor<T>>,
    ) -> Self {
        let (status_tx, _) = watch::channel(QueueStatus::default());
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                concurrent: concurrent.max(1),
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    running: 0,
                    done: 0,
                    failed: 0,
                    paused: false,
                    shut_down: false,
                    next_id: 0,
                    processor: Some(processor),
                }),
                status_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a workload. Refused after shutdown.
    pub fn push(&self, workload: T) -> Result<JobHandle, QueueError> {
        let handle = {
            let mut state = self.inner.lock();
            if state.shut_down {
                return Err(QueueError::ShutDown(self.inner.name.clone()));
            }

            let id = state.next_id;
            state.next_id += 1;

            let (tx, rx) = watch::channel(JobState::Enqueued);
            state.pending.push_back(QueueJob {
                id,
                workload,
                state: tx,
            });
            self.inner.status_tx.send_replace(state.status());

            JobHandle { id, state: rx }
        };

        debug!(queue = %self.inner.name, job_id = handle.id, "Job enqueued");
        self.inner.pump();
        Ok(handle)
    }

    /// Current counts.
    pub fn status(&self) -> QueueStatus {
        *self.inner.status_tx.borrow()
    }

    /// Resolves once nothing is enqueued or running.
    pub async fn drained(&self) {
        let mut rx = self.inner.status_tx.subscribe();
        let _ = rx.wait_for(|s| s.active() == 0).await;
    }

    /// Stop starting new jobs. Resolves once running jobs have finished;
    /// queued jobs stay queued.
    pub async fn pause(&self) {
        {
            let mut state = self.inner.lock();
            state.paused = true;
            self.inner.status_tx.send_replace(state.status());
        }

        let mut rx = self.inner.status_tx.subscribe();
        let _ = rx.wait_for(|s| s.running == 0).await;
    }

    /// Resume starting jobs after [`pause`](Self::pause).
    pub fn resume(&self) {
        {
            let mut state = self.inner.lock();
            state.paused = false;
            self.inner.status_tx.send_replace(state.status());
        }
        self.inner.pump();
    }

    /// Shut the queue down: optionally drain, then pause, detach the
    /// processor and finalize every job still queued.
    ///
    /// A paused queue is not drained: its queued jobs are finalized
    /// without running.
    pub async fn shutdown(&self, wait_for_drain: bool) {
        let paused = self.inner.lock().paused;
        if wait_for_drain && !paused {
            self.drained().await;
        }
        self.pause().await;

        let remaining: Vec<QueueJob<T>> = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            state.processor = None;
            let remaining = state.pending.drain(..).collect();
            self.inner.status_tx.send_replace(state.status());
            remaining
        };

        let dropped = remaining.len();
        for job in remaining {
            job.finalize("queue shut down");
        }

        info!(queue = %self.inner.name, dropped, "Queue shut down");
    }
}

impl<T: Send + 'static> QueueInner<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start jobs while capacity remains and work is queued.
    fn pump(self: &Arc<Self>) {
        let mut to_start = Vec::new();
        {
            let mut state = self.lock();
            if let Some(processor) = state.processor.clone() {
                while !state.paused && state.running < self.concurrent {
                    let Some(job) = state.pending.pop_front() else {
                        break;
                    };
                    state.running += 1;
                    to_start.push((job, processor.clone()));
                }
            }
            self.status_tx.send_replace(state.status());
        }

        for (job, processor) in to_start {
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run_job(job, processor).await;
            });
        }
    }

    async fn run_job(self: Arc<Self>, job: QueueJob<T>, processor: Arc<dyn JobProcessor<T>>) {
        let QueueJob {
            id,
            workload,
            state,
        } = job;
        state.send_replace(JobState::Started);

        let worker = processor.clone();
        let error = match tokio::spawn(async move { worker.process(workload).await }).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("job panicked: {e}")),
        };

        if let Some(ref e) = error {
            warn!(queue = %self.name, job_id = id, error = %e, "Job failed");
        }
        let failed = error.is_some();
        state.send_replace(JobState::Stopped { error });

        let drained = {
            let mut state = self.lock();
            state.running -= 1;
            state.done += 1;
            if failed {
                state.failed += 1;
            }
            state.pending.is_empty() && state.running == 0
        };

        self.pump();

        if drained {
            debug!(queue = %self.name, "Queue drained");
            processor.on_drained().await;
        }
    }
}
