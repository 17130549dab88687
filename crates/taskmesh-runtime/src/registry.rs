//! Registry of active runners on a node.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use taskmesh_core::{NodeId, RunnerId};

use crate::runner::RunnerError;

/// Summary of an active runner.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerInfo {
    pub id: RunnerId,
    pub node_id: Option<NodeId>,
    pub tasks: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// Active runners keyed by id, with an optional upper bound.
#[derive(Debug, Default)]
pub struct RunnerRegistry {
    /// 0 means unlimited.
    limit: usize,
    runners: Mutex<HashMap<RunnerId, RunnerInfo>>,
}

impl RunnerRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            runners: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn register(&self, info: RunnerInfo) -> Result<(), RunnerError> {
        let mut runners = self.runners.lock().unwrap_or_else(PoisonError::into_inner);
        if self.limit > 0 && runners.len() >= self.limit {
            return Err(RunnerError::ConcurrencyLimit { limit: self.limit });
        }
        debug!(runner_id = %info.id, active = runners.len() + 1, "Runner registered");
        runners.insert(info.id.clone(), info);
        Ok(())
    }

    pub fn remove(&self, id: &RunnerId) -> Option<RunnerInfo> {
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &RunnerId) -> Option<RunnerInfo> {
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Active runners, oldest first.
    pub fn list(&self) -> Vec<RunnerInfo> {
        let mut list: Vec<RunnerInfo> = self
            .runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by_key(|info| info.started_at);
        list
    }

    pub fn count(&self) -> usize {
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> RunnerInfo {
        RunnerInfo {
            id: RunnerId::new(id),
            node_id: None,
            tasks: vec!["a".to_string()],
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_limit_rejects_extra_runner() {
        let registry = RunnerRegistry::new(1);
        registry.register(info("r1")).unwrap();

        let err = registry.register(info("r2")).unwrap_err();
        assert!(matches!(err, RunnerError::ConcurrencyLimit { limit: 1 }));

        registry.remove(&RunnerId::new("r1"));
        registry.register(info("r2")).unwrap();
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_unlimited_list_and_get() {
        let registry = RunnerRegistry::new(0);
        for i in 0..10 {
            registry.register(info(&format!("r{i}"))).unwrap();
        }
        assert_eq!(registry.list().len(), 10);
        assert_eq!(registry.get(&RunnerId::new("r3")).unwrap().tasks, vec!["a"]);
        assert!(registry.get(&RunnerId::new("missing")).is_none());
    }
}
