//! In-memory storage implementation
//!
//! Keeps execution history in a map; suitable for tests and the default
//! single-process deployment.

use super::{ExecutionFilter, Storage};
use crate::Result;
use crate::model::{ExecutionStatus, WorkflowExecution};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// In-memory storage backend
pub struct MemoryStorage {
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
        }
    }

    fn matches(execution: &WorkflowExecution, filter: &ExecutionFilter) -> bool {
        if let Some(ref workflow) = filter.workflow
            && execution.workflow_name != *workflow
        {
            return false;
        }
        if let Some(status) = filter.status
            && execution.status != status
        {
            return false;
        }
        if let Some(since) = filter.since
            && execution.started_at < since
        {
            return false;
        }
        if let Some(until) = filter.until
            && execution.started_at > until
        {
            return false;
        }
        true
    }

    fn sorted_matches(&self, filter: &ExecutionFilter) -> Vec<WorkflowExecution> {
        let executions = self.executions.read();
        let mut matches: Vec<WorkflowExecution> = executions
            .values()
            .filter(|e| Self::matches(e, filter))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matches
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.executions
            .write()
            .insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.read().get(&id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        let matches = self.sorted_matches(filter);
        let limit = if filter.limit == 0 {
            crate::constants::HISTORY_PAGE_SIZE
        } else {
            filter.limit
        };
        Ok(matches
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect())
    }

    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<usize> {
        Ok(self
            .executions
            .read()
            .values()
            .filter(|e| Self::matches(e, filter))
            .count())
    }

    async fn prune_executions(&self, keep: usize) -> Result<u64> {
        let mut executions = self.executions.write();

        let mut finished: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = executions
            .values()
            .filter(|e| e.status != ExecutionStatus::Inprogress)
            .map(|e| (e.execution_id, e.started_at))
            .collect();
        if finished.len() <= keep {
            return Ok(0);
        }

        // Oldest first, evict everything past the retention cap.
        finished.sort_by(|a, b| a.1.cmp(&b.1));
        let excess = finished.len() - keep;
        let mut removed = 0u64;
        for (id, _) in finished.into_iter().take(excess) {
            if executions.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
