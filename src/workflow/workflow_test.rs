use super::*;
use crate::aggregator::{Aggregator, ArcDispatcher, BuiltinToolProvider};
use crate::auth::{OAuthClientConfig, build_auth};
use crate::event::EventBus;
use crate::model::{ArgSpec, ArgType};
use crate::storage::MemoryStorage;
use parking_lot::Mutex;
use serde_json::json;

/// Scriptable tool surface: canned results per tool name, recorded calls
struct ScriptedTools {
    results: HashMap<String, Value>,
    failing: Vec<String>,
    calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl BuiltinToolProvider for ScriptedTools {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        self.results
            .keys()
            .map(|name| ToolDescriptor {
                name: name.clone(),
                description: None,
                input_schema: json!({"type": "object"}),
                server: Some("muster".to_string()),
            })
            .collect()
    }

    fn owns(&self, tool: &str) -> bool {
        self.results.contains_key(tool) || self.failing.iter().any(|f| f == tool)
    }

    async fn call(&self, _session: Option<&str>, tool: &str, args: Value) -> Result<Value> {
        self.calls.lock().push((tool.to_string(), args));
        if self.failing.iter().any(|f| f == tool) {
            return Err(MusterError::network("connection refused"));
        }
        Ok(self.results[tool].clone())
    }
}

struct Harness {
    engine: WorkflowEngine,
    tools: Arc<ScriptedTools>,
}

fn harness(results: Vec<(&str, Value)>, failing: Vec<&str>) -> Harness {
    let (_, _, egress) = build_auth(
        OAuthClientConfig {
            client_id: "muster".to_string(),
            client_secret: None,
            redirect_uri: "http://localhost:8090/oauth/proxy/callback".to_string(),
        },
        None,
    )
    .unwrap();
    let aggregator = Arc::new(Aggregator::new(egress, Arc::new(EventBus::new())));

    let tools = Arc::new(ScriptedTools {
        results: results
            .into_iter()
            .map(|(name, result)| (name.to_string(), result))
            .collect(),
        failing: failing.into_iter().map(String::from).collect(),
        calls: Mutex::new(Vec::new()),
    });
    aggregator.add_provider(tools.clone());

    let registry = Arc::new(crate::registry::HandlerRegistry::new());
    registry.register(
        crate::constants::HANDLER_TOOL_DISPATCHER,
        Arc::new(ArcDispatcher(aggregator)),
    );

    Harness {
        engine: WorkflowEngine::new(registry, Arc::new(MemoryStorage::new()), 100),
        tools,
    }
}

fn step(id: &str, tool: &str) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        tool: tool.to_string(),
        args: HashMap::new(),
        condition: None,
        outputs: HashMap::new(),
        allow_failure: false,
        store: false,
        description: None,
    }
}

fn string_arg(required: bool) -> ArgSpec {
    ArgSpec {
        arg_type: ArgType::String,
        required,
        default: None,
        description: None,
    }
}

fn debug_pods_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "debug-pods".to_string(),
        description: None,
        args: HashMap::from([("namespace".to_string(), string_arg(true))]),
        steps: vec![
            WorkflowStep {
                args: HashMap::from([
                    ("namespace".to_string(), json!("{{ .namespace }}")),
                    ("status".to_string(), json!("failed")),
                ]),
                store: true,
                ..step("find-pods", "x_kubernetes_get_pods")
            },
            WorkflowStep {
                args: HashMap::from([(
                    "count".to_string(),
                    json!("{{ steps.find-pods.pod_count }}"),
                )]),
                condition: Some(StepCondition {
                    from_step: Some("find-pods".to_string()),
                    tool: None,
                    args: HashMap::new(),
                    expect: None,
                    expect_not: Some(ExpectClause {
                        success: None,
                        json_path: HashMap::from([("pod_count".to_string(), json!(0))]),
                    }),
                }),
                ..step("get-logs", "x_kubernetes_get_logs")
            },
        ],
    }
}

fn input(namespace: &str) -> HashMap<String, Value> {
    HashMap::from([("namespace".to_string(), json!(namespace))])
}

#[tokio::test]
async fn test_steps_run_in_order_with_templating() {
    let harness = harness(
        vec![
            ("x_kubernetes_get_pods", json!({"pod_count": 2})),
            ("x_kubernetes_get_logs", json!({"logs": ["boom"]})),
        ],
        vec![],
    );

    let execution = harness
        .engine
        .execute(
            &debug_pods_workflow(),
            input("default"),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps.len(), 2);
    assert_eq!(execution.steps[0].step_id, "find-pods");
    assert_eq!(execution.steps[0].status, StepStatus::Completed);
    assert_eq!(execution.steps[0].stored_as.as_deref(), Some("find-pods"));
    assert_eq!(execution.steps[1].step_id, "get-logs");
    assert_eq!(execution.steps[1].status, StepStatus::Completed);

    // Resolved input recorded after templating.
    assert_eq!(execution.steps[0].input["namespace"], json!("default"));
    assert_eq!(execution.steps[1].input["count"], json!(2));

    let calls = harness.tools.calls.lock();
    assert_eq!(calls[0].0, "x_kubernetes_get_pods");
    assert_eq!(calls[1].0, "x_kubernetes_get_logs");
}

#[tokio::test]
async fn test_condition_skip_keeps_execution_completed() {
    let harness = harness(
        vec![
            ("x_kubernetes_get_pods", json!({"pod_count": 0})),
            ("x_kubernetes_get_logs", json!({"logs": []})),
        ],
        vec![],
    );

    let execution = harness
        .engine
        .execute(
            &debug_pods_workflow(),
            input("default"),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps[0].status, StepStatus::Completed);
    // Skipped steps still appear in the record, in definition order.
    assert_eq!(execution.steps[1].step_id, "get-logs");
    assert_eq!(execution.steps[1].status, StepStatus::Skipped);

    // The gated tool was never called.
    let calls = harness.tools.calls.lock();
    assert_eq!(calls.len(), 1);
}

#[tokio::test]
async fn test_condition_tool_call_with_expect() {
    let mut workflow = debug_pods_workflow();
    workflow.steps[1].condition = Some(StepCondition {
        from_step: None,
        tool: Some("health_probe".to_string()),
        args: HashMap::new(),
        expect: Some(ExpectClause {
            success: Some(true),
            json_path: HashMap::from([("status".to_string(), json!("ready"))]),
        }),
        expect_not: None,
    });

    let harness = harness(
        vec![
            ("x_kubernetes_get_pods", json!({"pod_count": 3})),
            ("x_kubernetes_get_logs", json!({"logs": []})),
            ("health_probe", json!({"status": "ready"})),
        ],
        vec![],
    );

    let execution = harness
        .engine
        .execute(&workflow, input("default"), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.steps[1].status, StepStatus::Completed);
}

#[tokio::test]
async fn test_failed_condition_tool_counts_as_unmet_success() {
    let mut workflow = debug_pods_workflow();
    workflow.steps[1].condition = Some(StepCondition {
        from_step: None,
        tool: Some("health_probe".to_string()),
        args: HashMap::new(),
        expect: Some(ExpectClause {
            success: Some(true),
            json_path: HashMap::new(),
        }),
        expect_not: None,
    });

    let harness = harness(
        vec![
            ("x_kubernetes_get_pods", json!({"pod_count": 3})),
            ("x_kubernetes_get_logs", json!({"logs": []})),
        ],
        vec!["health_probe"],
    );

    let execution = harness
        .engine
        .execute(&workflow, input("default"), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.steps[1].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_step_failure_fails_execution_and_stops() {
    let workflow = WorkflowDefinition {
        name: "failing".to_string(),
        description: None,
        args: HashMap::new(),
        steps: vec![
            step("first", "breaks"),
            step("never", "x_kubernetes_get_pods"),
        ],
    };

    let harness = harness(
        vec![("x_kubernetes_get_pods", json!({}))],
        vec!["breaks"],
    );

    let execution = harness
        .engine
        .execute(&workflow, HashMap::new(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.is_some());
    // The failing step is recorded; the next one never ran. The recorded
    // step ids remain a prefix of the definition's.
    assert_eq!(execution.steps.len(), 1);
    assert_eq!(execution.steps[0].status, StepStatus::Failed);
    assert!(harness.tools.calls.lock().len() == 1);
}

#[tokio::test]
async fn test_allow_failure_continues() {
    let workflow = WorkflowDefinition {
        name: "tolerant".to_string(),
        description: None,
        args: HashMap::new(),
        steps: vec![
            WorkflowStep {
                allow_failure: true,
                ..step("flaky", "breaks")
            },
            step("after", "x_kubernetes_get_pods"),
        ],
    };

    let harness = harness(
        vec![("x_kubernetes_get_pods", json!({"pod_count": 1}))],
        vec!["breaks"],
    );

    let execution = harness
        .engine
        .execute(&workflow, HashMap::new(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps[0].status, StepStatus::Failed);
    assert!(execution.steps[0].error.is_some());
    assert_eq!(execution.steps[1].status, StepStatus::Completed);
}

#[tokio::test]
async fn test_input_validation() {
    let harness = harness(vec![("x_kubernetes_get_pods", json!({}))], vec![]);
    let workflow = debug_pods_workflow();

    // Missing required argument.
    let err = harness
        .engine
        .execute(&workflow, HashMap::new(), None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("namespace"));

    // Unknown argument.
    let mut bad = input("default");
    bad.insert("bogus".to_string(), json!(1));
    let err = harness
        .engine
        .execute(&workflow, bad, None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bogus"));
}

#[tokio::test]
async fn test_defaults_applied() {
    let workflow = WorkflowDefinition {
        name: "defaulted".to_string(),
        description: None,
        args: HashMap::from([(
            "status".to_string(),
            ArgSpec {
                arg_type: ArgType::String,
                required: false,
                default: Some(json!("failed")),
                description: None,
            },
        )]),
        steps: vec![WorkflowStep {
            args: HashMap::from([("status".to_string(), json!("{{ .status }}"))]),
            ..step("query", "x_kubernetes_get_pods")
        }],
    };

    let harness = harness(vec![("x_kubernetes_get_pods", json!({}))], vec![]);
    let execution = harness
        .engine
        .execute(&workflow, HashMap::new(), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.steps[0].input["status"], json!("failed"));
}

#[tokio::test]
async fn test_outputs_extraction_and_missing_path_warning() {
    let workflow = WorkflowDefinition {
        name: "outputs".to_string(),
        description: None,
        args: HashMap::new(),
        steps: vec![
            WorkflowStep {
                outputs: HashMap::from([
                    ("first_pod".to_string(), "pods.0.name".to_string()),
                    ("missing".to_string(), "nowhere".to_string()),
                ]),
                ..step("query", "x_kubernetes_get_pods")
            },
            WorkflowStep {
                args: HashMap::from([("pod".to_string(), json!("{{ .first_pod }}"))]),
                ..step("use-it", "x_kubernetes_get_logs")
            },
        ],
    };

    let harness = harness(
        vec![
            ("x_kubernetes_get_pods", json!({"pods": [{"name": "api-0"}]})),
            ("x_kubernetes_get_logs", json!({})),
        ],
        vec![],
    );

    let execution = harness
        .engine
        .execute(&workflow, HashMap::new(), None, CancellationToken::new())
        .await
        .unwrap();

    assert!(
        execution.steps[0]
            .warnings
            .iter()
            .any(|w| w.contains("nowhere"))
    );
    assert_eq!(execution.steps[1].input["pod"], json!("api-0"));
}

#[tokio::test]
async fn test_unresolved_template_warns_and_renders_empty() {
    let workflow = WorkflowDefinition {
        name: "unresolved".to_string(),
        description: None,
        args: HashMap::new(),
        steps: vec![WorkflowStep {
            args: HashMap::from([("value".to_string(), json!("pre-{{ .ghost }}-post"))]),
            ..step("query", "x_kubernetes_get_pods")
        }],
    };

    let harness = harness(vec![("x_kubernetes_get_pods", json!({}))], vec![]);
    let execution = harness
        .engine
        .execute(&workflow, HashMap::new(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(execution.steps[0].input["value"], json!("pre--post"));
    assert!(
        execution.steps[0]
            .warnings
            .iter()
            .any(|w| w.contains("ghost"))
    );
}

#[tokio::test]
async fn test_cancellation_fails_execution() {
    let harness = harness(
        vec![("x_kubernetes_get_pods", json!({"pod_count": 1}))],
        vec![],
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let execution = harness
        .engine
        .execute(&debug_pods_workflow(), input("default"), None, cancel)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("cancelled"));
    assert!(execution.steps.is_empty());
}

#[tokio::test]
async fn test_history_persisted_and_queryable() {
    let harness = harness(
        vec![
            ("x_kubernetes_get_pods", json!({"pod_count": 2})),
            ("x_kubernetes_get_logs", json!({"logs": []})),
        ],
        vec![],
    );

    let first = harness
        .engine
        .execute(
            &debug_pods_workflow(),
            input("default"),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let second = harness
        .engine
        .execute(
            &debug_pods_workflow(),
            input("default"),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let listed = harness
        .engine
        .list_executions(&ExecutionFilter {
            workflow: Some("debug-pods".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);

    let fetched = harness.engine.get_execution(first.execution_id).await.unwrap();
    assert_eq!(fetched.steps.len(), 2);

    // Identical input and identical tool behavior: identical result modulo
    // ids and timestamps.
    assert_eq!(first.result, second.result);
    assert_ne!(first.execution_id, second.execution_id);
}
