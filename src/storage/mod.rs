//! Storage backends for workflow execution history
//!
//! Provides a unified trait with in-memory and SQLite implementations.
//! Catalogs and supervisor state stay in memory by design; only execution
//! history is durable.

pub mod memory;
pub mod sqlite;

use crate::model::{ExecutionStatus, WorkflowExecution};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Query filter for execution history
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// Storage trait for persisting workflow executions
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or update an execution record
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Get an execution by id
    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>>;

    /// List executions matching the filter, newest first
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>>;

    /// Count executions matching the filter (ignores limit/offset)
    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<usize>;

    /// Evict the oldest finished executions beyond `keep`; returns how many
    /// were removed. In-progress records are never evicted.
    async fn prune_executions(&self, keep: usize) -> Result<u64>;
}

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Create a storage backend from configuration
pub async fn create_storage_from_config(
    config: &crate::config::StorageConfig,
) -> Result<Arc<dyn Storage>> {
    match config.driver.as_str() {
        "memory" => Ok(Arc::new(MemoryStorage::new())),
        "sqlite" => Ok(Arc::new(SqliteStorage::new(&config.dsn).await?)),
        other => Err(crate::MusterError::config(format!(
            "Unknown storage driver: {}. Supported: memory, sqlite",
            other
        ))),
    }
}

#[cfg(test)]
mod storage_test;
