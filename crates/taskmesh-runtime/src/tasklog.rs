//! Task log: per-task, per-node records of finished runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::debug;

use taskmesh_core::{NodeId, TaskRunStatus, TaskRunnerResult};

#[derive(Debug, Error)]
pub enum TaskLogError {
    #[error("Task log storage error: {0}")]
    Storage(String),
}

/// Mutual exclusion per key. Entries are dropped once nobody holds or waits
/// for them.
#[derive(Debug, Default)]
pub struct KeyedLock {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl KeyedLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(self: &Arc<Self>, key: &str) -> KeyedGuard {
        let semaphore = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        // The semaphore is never closed.
        let permit = semaphore.clone().acquire_owned().await.ok();
        KeyedGuard {
            key: key.to_string(),
            owner: self.clone(),
            semaphore,
            permit,
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock on one key.
pub struct KeyedGuard {
    key: String,
    owner: Arc<KeyedLock>,
    semaphore: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.permit.take();
        let mut locks = self
            .owner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: no waiters left.
        if Arc::strong_count(&self.semaphore) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// One stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogRow {
    pub run_id: String,
    pub task_name: String,
    pub node_id: NodeId,
    pub status: TaskRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent log of runner results.
#[async_trait]
pub trait TaskLogStore: Send + Sync {
    /// Upsert one row per task of `result`. Returns the number of rows written.
    async fn save(&self, run_id: &str, result: &TaskRunnerResult) -> Result<usize, TaskLogError>;

    async fn rows(&self, run_id: &str) -> Result<Vec<TaskLogRow>, TaskLogError>;
}

type RowKey = (String, String, NodeId);

/// In-memory task log.
pub struct MemoryTaskLog {
    rows: RwLock<BTreeMap<RowKey, TaskLogRow>>,
    writers: Arc<KeyedLock>,
    /// Node recorded when a result carries none.
    local: NodeId,
}

impl MemoryTaskLog {
    pub fn new(local: NodeId) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            writers: KeyedLock::new(),
            local,
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskLogStore for MemoryTaskLog {
    async fn save(&self, run_id: &str, result: &TaskRunnerResult) -> Result<usize, TaskLogError> {
        let _guard = self.writers.acquire(run_id).await;
        let node_id = result.node_id.clone().unwrap_or_else(|| self.local.clone());
        let now = Utc::now();

        // Merge against what is stored, then write back.
        let mut merged: BTreeMap<RowKey, TaskLogRow> = {
            let rows = self.rows.read().await;
            rows.range(
                (run_id.to_string(), String::new(), NodeId::default())..,
            )
            .take_while(|((run, _, _), _)| run == run_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
        };

        for entry in &result.tasks {
            let key = (run_id.to_string(), entry.name.clone(), node_id.clone());
            merged.insert(
                key,
                TaskLogRow {
                    run_id: run_id.to_string(),
                    task_name: entry.name.clone(),
                    node_id: node_id.clone(),
                    status: entry.status,
                    started_at: entry.started_at,
                    stopped_at: entry.stopped_at,
                    duration_ms: entry.duration_ms,
                    result: entry.result.clone(),
                    error: entry.error.clone(),
                    updated_at: now,
                },
            );
        }

        let written = result.tasks.len();
        self.rows.write().await.extend(merged);
        debug!(run_id = %run_id, node_id = %node_id, rows = written, "Saved task log");
        Ok(written)
    }

    async fn rows(&self, run_id: &str) -> Result<Vec<TaskLogRow>, TaskLogError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.run_id == run_id)
            .cloned()
            .collect())
    }
}
