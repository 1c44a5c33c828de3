use super::*;
use crate::model::{StepExecution, StepStatus};
use std::collections::HashMap;

fn execution(name: &str, status: ExecutionStatus, offset_secs: i64) -> WorkflowExecution {
    WorkflowExecution {
        execution_id: Uuid::new_v4(),
        workflow_name: name.to_string(),
        status,
        started_at: Utc::now() - chrono::Duration::seconds(offset_secs),
        completed_at: (status != ExecutionStatus::Inprogress).then(Utc::now),
        duration_ms: 12,
        input: HashMap::from([("namespace".to_string(), serde_json::json!("default"))]),
        result: Some(serde_json::json!({"ok": true})),
        error: None,
        steps: vec![StepExecution {
            step_id: "find-pods".to_string(),
            status: StepStatus::Completed,
            input: serde_json::json!({"namespace": "default"}),
            result: Some(serde_json::json!({"pod_count": 0})),
            error: None,
            duration_ms: 5,
            stored_as: Some("find-pods".to_string()),
            warnings: vec![],
        }],
    }
}

async fn backends() -> Vec<(&'static str, std::sync::Arc<dyn Storage>)> {
    vec![
        ("memory", std::sync::Arc::new(MemoryStorage::new()) as _),
        (
            "sqlite",
            std::sync::Arc::new(SqliteStorage::new(":memory:").await.unwrap()) as _,
        ),
    ]
}

#[tokio::test]
async fn test_save_and_get_roundtrip() {
    for (name, storage) in backends().await {
        let execution = execution("debug-pods", ExecutionStatus::Completed, 0);
        storage.save_execution(&execution).await.unwrap();

        let fetched = storage
            .get_execution(execution.execution_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{}: execution missing", name));
        assert_eq!(fetched.workflow_name, "debug-pods");
        assert_eq!(fetched.status, ExecutionStatus::Completed);
        assert_eq!(fetched.steps.len(), 1);
        assert_eq!(fetched.steps[0].step_id, "find-pods");
    }
}

#[tokio::test]
async fn test_save_updates_existing() {
    for (_, storage) in backends().await {
        let mut execution = execution("debug-pods", ExecutionStatus::Inprogress, 0);
        storage.save_execution(&execution).await.unwrap();

        execution.status = ExecutionStatus::Failed;
        execution.error = Some("boom".to_string());
        storage.save_execution(&execution).await.unwrap();

        let fetched = storage
            .get_execution(execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("boom"));
    }
}

#[tokio::test]
async fn test_list_filters_and_pagination() {
    for (name, storage) in backends().await {
        for i in 0..5 {
            storage
                .save_execution(&execution("debug-pods", ExecutionStatus::Completed, i * 10))
                .await
                .unwrap();
        }
        storage
            .save_execution(&execution("other", ExecutionStatus::Failed, 100))
            .await
            .unwrap();

        let filter = ExecutionFilter {
            workflow: Some("debug-pods".to_string()),
            ..Default::default()
        };
        let listed = storage.list_executions(&filter).await.unwrap();
        assert_eq!(listed.len(), 5, "{}: name filter", name);
        // Newest first.
        assert!(listed.windows(2).all(|w| w[0].started_at >= w[1].started_at));

        let failed = storage
            .list_executions(&ExecutionFilter {
                status: Some(ExecutionStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].workflow_name, "other");

        let page = storage
            .list_executions(&ExecutionFilter {
                workflow: Some("debug-pods".to_string()),
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2, "{}: pagination", name);

        let count = storage
            .count_executions(&ExecutionFilter {
                workflow: Some("debug-pods".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(count, 5);
    }
}

#[tokio::test]
async fn test_time_window_filter() {
    for (_, storage) in backends().await {
        storage
            .save_execution(&execution("w", ExecutionStatus::Completed, 3600))
            .await
            .unwrap();
        storage
            .save_execution(&execution("w", ExecutionStatus::Completed, 0))
            .await
            .unwrap();

        let recent = storage
            .list_executions(&ExecutionFilter {
                since: Some(Utc::now() - chrono::Duration::seconds(600)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }
}

#[tokio::test]
async fn test_prune_keeps_inprogress_and_newest() {
    for (name, storage) in backends().await {
        let running = execution("w", ExecutionStatus::Inprogress, 500);
        storage.save_execution(&running).await.unwrap();
        for i in 0..4 {
            storage
                .save_execution(&execution("w", ExecutionStatus::Completed, i * 10))
                .await
                .unwrap();
        }

        let removed = storage.prune_executions(2).await.unwrap();
        assert_eq!(removed, 2, "{}: prune count", name);

        // In-progress record survives even though it is the oldest.
        let fetched = storage.get_execution(running.execution_id).await.unwrap();
        assert!(fetched.is_some(), "{}: inprogress must survive prune", name);

        let all = storage
            .count_executions(&ExecutionFilter::default())
            .await
            .unwrap();
        assert_eq!(all, 3);
    }
}
