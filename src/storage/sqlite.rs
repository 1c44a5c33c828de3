//! SQLite storage implementation
//!
//! Persists workflow execution history using SQLite. Step records travel as
//! a JSON column; the query fields get their own columns and indexes.

use super::{ExecutionFilter, Storage};
use crate::model::{ExecutionStatus, WorkflowExecution};
use crate::{MusterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

/// SQLite storage backend
pub struct SqliteStorage {
    pool: SqlitePool,
}

fn status_to_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Inprogress => "inprogress",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> ExecutionStatus {
    match s {
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        _ => ExecutionStatus::Inprogress,
    }
}

impl SqliteStorage {
    /// Create a new SQLite storage
    ///
    /// # Arguments
    /// * `dsn` - Database path (e.g. ".muster/muster.db" or ":memory:")
    pub async fn new(dsn: &str) -> Result<Self> {
        let connection_string = if dsn.starts_with("sqlite:") {
            if dsn.contains('?') {
                dsn.to_string()
            } else {
                format!("{}?mode=rwc", dsn)
            }
        } else {
            format!("sqlite:{}?mode=rwc", dsn)
        };

        let file_path = dsn.strip_prefix("sqlite:").unwrap_or(dsn);

        // Reject traversal in configured paths.
        if file_path.contains("..") {
            return Err(MusterError::config(
                "Database path cannot contain '..' (path traversal not allowed)",
            ));
        }

        if file_path != ":memory:"
            && let Some(parent) = Path::new(file_path).parent()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        // An in-memory database exists per connection; pin the pool to one
        // connection so every query sees the same database.
        let pool = if file_path == ":memory:" {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .connect(&connection_string)
                .await
        } else {
            SqlitePool::connect(&connection_string).await
        }
        .map_err(|e| MusterError::storage(format!("Failed to connect to SQLite: {}", e)))?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations/sqlite")
            .run(&pool)
            .await
            .map_err(|e| MusterError::storage(format!("Failed to run migrations: {}", e)))?;

        Ok(Self { pool })
    }

    fn parse_execution(row: &SqliteRow) -> Result<WorkflowExecution> {
        Ok(WorkflowExecution {
            execution_id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
            workflow_name: row.try_get("workflow_name")?,
            status: parse_status(&row.try_get::<String, _>("status")?),
            started_at: DateTime::from_timestamp(row.try_get("started_at")?, 0)
                .unwrap_or_else(Utc::now),
            completed_at: row
                .try_get::<Option<i64>, _>("completed_at")?
                .map(|ts| DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)),
            duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
            input: serde_json::from_str(&row.try_get::<String, _>("input")?)?,
            result: row
                .try_get::<Option<String>, _>("result")?
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            error: row.try_get("error")?,
            steps: serde_json::from_str(&row.try_get::<String, _>("steps")?)?,
        })
    }

    /// WHERE clause + binds shared by list and count
    fn filter_clause(filter: &ExecutionFilter) -> (String, Vec<Bind>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        if let Some(ref workflow) = filter.workflow {
            clauses.push("workflow_name = ?".to_string());
            binds.push(Bind::Text(workflow.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            binds.push(Bind::Text(status_to_str(status).to_string()));
        }
        if let Some(since) = filter.since {
            clauses.push("started_at >= ?".to_string());
            binds.push(Bind::Int(since.timestamp()));
        }
        if let Some(until) = filter.until {
            clauses.push("started_at <= ?".to_string());
            binds.push(Bind::Int(until.timestamp()));
        }

        let clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (clause, binds)
    }
}

/// Dynamically built query parameter; timestamps must bind as integers so
/// SQLite compares them against the INTEGER column correctly.
enum Bind {
    Text(String),
    Int(i64),
}

fn apply_binds<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [Bind],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(value) => query.bind(value.as_str()),
            Bind::Int(value) => query.bind(*value),
        };
    }
    query
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflow_executions
                (id, workflow_name, status, started_at, completed_at, duration_ms, input, result, error, steps)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                duration_ms = excluded.duration_ms,
                result = excluded.result,
                error = excluded.error,
                steps = excluded.steps",
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.workflow_name)
        .bind(status_to_str(execution.status))
        .bind(execution.started_at.timestamp())
        .bind(execution.completed_at.map(|dt| dt.timestamp()))
        .bind(execution.duration_ms as i64)
        .bind(serde_json::to_string(&execution.input)?)
        .bind(
            execution
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&execution.error)
        .bind(serde_json::to_string(&execution.steps)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::parse_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>> {
        let (clause, binds) = Self::filter_clause(filter);
        let limit = if filter.limit == 0 {
            crate::constants::HISTORY_PAGE_SIZE
        } else {
            filter.limit.min(10_000)
        };

        let sql = format!(
            "SELECT * FROM workflow_executions{} ORDER BY started_at DESC LIMIT ? OFFSET ?",
            clause
        );
        let query = apply_binds(sqlx::query(&sql), &binds)
            .bind(limit as i64)
            .bind(filter.offset as i64);

        let rows = query.fetch_all(&self.pool).await?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            executions.push(Self::parse_execution(&row)?);
        }
        Ok(executions)
    }

    async fn count_executions(&self, filter: &ExecutionFilter) -> Result<usize> {
        let (clause, binds) = Self::filter_clause(filter);
        let sql = format!("SELECT COUNT(*) AS n FROM workflow_executions{}", clause);
        let row = apply_binds(sqlx::query(&sql), &binds)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as usize)
    }

    async fn prune_executions(&self, keep: usize) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM workflow_executions
             WHERE status != 'inprogress'
               AND id NOT IN (
                   SELECT id FROM workflow_executions
                   WHERE status != 'inprogress'
                   ORDER BY started_at DESC
                   LIMIT ?
               )",
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
