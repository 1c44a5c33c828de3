//! Workflow engine
//!
//! Executes ordered, templated, conditionally gated tool pipelines against
//! the aggregator. Every execution persists a durable record with per-step
//! detail; history is bounded and queryable.

pub mod template;

use crate::aggregator::{BuiltinToolProvider, ToolDispatcher};
use crate::config::DefinitionStore;
use crate::model::{
    ExecutionStatus, ExpectClause, StepCondition, StepExecution, StepStatus, ToolDescriptor,
    WorkflowDefinition, WorkflowExecution, WorkflowStep, validate_args,
};
use crate::registry::HandlerRegistry;
use crate::storage::{ExecutionFilter, Storage};
use crate::{MusterError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use template::{Templater, lookup_path, render_args};

/// Executes workflows and records their history
pub struct WorkflowEngine {
    registry: Arc<HandlerRegistry>,
    storage: Arc<dyn Storage>,
    history_limit: usize,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        storage: Arc<dyn Storage>,
        history_limit: usize,
    ) -> Self {
        Self {
            registry,
            storage,
            history_limit,
        }
    }

    fn dispatcher(&self) -> Result<Arc<crate::aggregator::ArcDispatcher>> {
        self.registry
            .get::<crate::aggregator::ArcDispatcher>(crate::constants::HANDLER_TOOL_DISPATCHER)
            .ok_or_else(|| MusterError::internal("tool dispatcher not registered"))
    }

    /// Execute a workflow. Steps run in definition order; the session is
    /// carried through when the workflow was invoked in a session context.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: HashMap<String, Value>,
        session: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution> {
        definition.validate()?;
        let validated = validate_args(&definition.args, &input)
            .map_err(|e| e.context(format!("workflow '{}'", definition.name)))?;

        let started = std::time::Instant::now();
        let mut execution = WorkflowExecution {
            execution_id: Uuid::new_v4(),
            workflow_name: definition.name.clone(),
            status: ExecutionStatus::Inprogress,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            input: validated.clone(),
            result: None,
            error: None,
            steps: Vec::new(),
        };
        self.storage.save_execution(&execution).await?;

        // The running scope: input values, named outputs, stored results
        // under "steps".
        let mut scope: HashMap<String, Value> = validated;
        scope.insert("steps".to_string(), json!({}));

        let dispatcher = self.dispatcher()?;
        let mut failure: Option<String> = None;

        for step in &definition.steps {
            if cancel.is_cancelled() {
                failure = Some("cancelled".to_string());
                break;
            }

            let record = self
                .execute_step(step, &mut scope, session, dispatcher.as_ref(), &cancel)
                .await;

            let failed = record.status == StepStatus::Failed;
            let error = record.error.clone();
            execution.steps.push(record);
            self.storage.save_execution(&execution).await?;

            if failed && !step.allow_failure {
                failure = error.or_else(|| Some("step failed".to_string()));
                break;
            }
        }

        execution.duration_ms = started.elapsed().as_millis() as u64;
        execution.completed_at = Some(Utc::now());
        match failure {
            Some(error) => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(error);
            }
            None => {
                execution.status = ExecutionStatus::Completed;
                execution.result = Some(serde_json::to_value(&scope)?);
            }
        }
        self.storage.save_execution(&execution).await?;

        if let Err(e) = self.storage.prune_executions(self.history_limit).await {
            tracing::debug!("history pruning failed: {}", e);
        }

        Ok(execution)
    }

    async fn execute_step(
        &self,
        step: &WorkflowStep,
        scope: &mut HashMap<String, Value>,
        session: Option<&str>,
        dispatcher: &crate::aggregator::ArcDispatcher,
        cancel: &CancellationToken,
    ) -> StepExecution {
        let step_started = std::time::Instant::now();
        let mut record = StepExecution {
            step_id: step.id.clone(),
            status: StepStatus::Completed,
            input: Value::Null,
            result: None,
            error: None,
            duration_ms: 0,
            stored_as: None,
            warnings: Vec::new(),
        };

        // Conditional gating: unmet conditions skip the step, which still
        // appears in the record.
        if let Some(condition) = &step.condition {
            match self
                .condition_met(condition, scope, session, dispatcher, cancel)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("step '{}' skipped, condition not met", step.id);
                    record.status = StepStatus::Skipped;
                    record.duration_ms = step_started.elapsed().as_millis() as u64;
                    return record;
                }
                Err(e) => {
                    record.status = StepStatus::Failed;
                    record.error = Some(format!("condition evaluation failed: {}", e));
                    record.duration_ms = step_started.elapsed().as_millis() as u64;
                    return record;
                }
            }
        }

        let (args, warnings) = match render_args(&step.args, scope) {
            Ok(rendered) => rendered,
            Err(e) => {
                record.status = StepStatus::Failed;
                record.error = Some(e.to_string());
                record.duration_ms = step_started.elapsed().as_millis() as u64;
                return record;
            }
        };
        record.warnings = warnings;
        record.input = Value::Object(args.clone());

        let result = self
            .dispatch(dispatcher, session, &step.tool, Value::Object(args), cancel)
            .await;
        record.duration_ms = step_started.elapsed().as_millis() as u64;

        match result {
            Ok(result) => {
                for (output, path) in &step.outputs {
                    match lookup_path(&result, path) {
                        Some(value) => {
                            scope.insert(output.clone(), value);
                        }
                        None => record
                            .warnings
                            .push(format!("output '{}': path '{}' not found", output, path)),
                    }
                }
                if step.store {
                    if let Some(Value::Object(steps)) = scope.get_mut("steps") {
                        steps.insert(step.id.clone(), result.clone());
                    }
                    record.stored_as = Some(step.id.clone());
                }
                record.result = Some(result);
            }
            Err(e) => {
                record.status = StepStatus::Failed;
                record.error = Some(e.to_string());
            }
        }

        record
    }

    async fn dispatch(
        &self,
        dispatcher: &crate::aggregator::ArcDispatcher,
        session: Option<&str>,
        tool: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        tokio::select! {
            result = dispatcher.dispatch_tool(session, tool, args) => result,
            _ = cancel.cancelled() => Err(MusterError::Cancelled("cancelled".to_string())),
        }
    }

    /// Evaluate a step condition: the subject is either a prior step's
    /// stored result (`from_step`) or a fresh condition tool call.
    async fn condition_met(
        &self,
        condition: &StepCondition,
        scope: &HashMap<String, Value>,
        session: Option<&str>,
        dispatcher: &crate::aggregator::ArcDispatcher,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let (subject, call_succeeded) = if let Some(from_step) = &condition.from_step {
            let stored = scope
                .get("steps")
                .and_then(|steps| steps.get(from_step))
                .cloned()
                .ok_or_else(|| {
                    MusterError::validation(format!(
                        "condition references unstored step '{}'",
                        from_step
                    ))
                })?;
            (stored, true)
        } else if let Some(tool) = &condition.tool {
            let (args, _) = render_args(&condition.args, scope)?;
            match self
                .dispatch(dispatcher, session, tool, Value::Object(args), cancel)
                .await
            {
                Ok(result) => (result, true),
                Err(_) => (Value::Null, false),
            }
        } else {
            return Err(MusterError::validation(
                "condition needs either from_step or tool",
            ));
        };

        let mut met = true;
        if let Some(expect) = &condition.expect {
            met &= clause_matches(expect, &subject, call_succeeded);
        }
        if let Some(expect_not) = &condition.expect_not {
            met &= !clause_matches(expect_not, &subject, call_succeeded);
        }
        Ok(met)
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>> {
        self.storage.list_executions(filter).await
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution> {
        self.storage
            .get_execution(id)
            .await?
            .ok_or_else(|| MusterError::not_found("workflow execution", id.to_string()))
    }
}

/// Exact-match evaluation of one expect clause (success flag plus dot-path
/// equality over the subject)
fn clause_matches(clause: &ExpectClause, subject: &Value, call_succeeded: bool) -> bool {
    if let Some(success) = clause.success
        && success != call_succeeded
    {
        return false;
    }
    clause
        .json_path
        .iter()
        .all(|(path, expected)| lookup_path(subject, path).as_ref() == Some(expected))
}

// ---------------------------------------------------------------------------
// Aggregator tool surface
// ---------------------------------------------------------------------------

/// Exposes `workflow_<name>` tools plus the execution history tools through
/// the aggregator.
pub struct WorkflowToolProvider {
    engine: Arc<WorkflowEngine>,
    definitions: Arc<DefinitionStore>,
}

impl WorkflowToolProvider {
    pub fn new(engine: Arc<WorkflowEngine>, definitions: Arc<DefinitionStore>) -> Self {
        Self {
            engine,
            definitions,
        }
    }

    fn workflow_for_tool(&self, tool: &str) -> Option<WorkflowDefinition> {
        let name = tool.strip_prefix(crate::constants::WORKFLOW_TOOL_PREFIX)?;
        self.definitions.get_workflow(name)
    }

    fn arg_schema(definition: &WorkflowDefinition) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in &definition.args {
            let mut property = Map::new();
            property.insert("type".to_string(), json!(spec.arg_type.as_str()));
            if let Some(ref description) = spec.description {
                property.insert("description".to_string(), json!(description));
            }
            if let Some(ref default) = spec.default {
                property.insert("default".to_string(), default.clone());
            }
            properties.insert(name.clone(), Value::Object(property));
            if spec.required {
                required.push(name.clone());
            }
        }
        required.sort();
        json!({"type": "object", "properties": properties, "required": required})
    }
}

#[async_trait]
impl BuiltinToolProvider for WorkflowToolProvider {
    fn provider_name(&self) -> &str {
        "workflows"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .definitions
            .list_workflows()
            .iter()
            .map(|definition| ToolDescriptor {
                name: format!(
                    "{}{}",
                    crate::constants::WORKFLOW_TOOL_PREFIX,
                    definition.name
                ),
                description: definition.description.clone(),
                input_schema: Self::arg_schema(definition),
                server: Some("muster".to_string()),
            })
            .collect();

        tools.push(ToolDescriptor {
            name: "workflow_execution_list".to_string(),
            description: Some("List workflow executions, newest first".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "workflow": {"type": "string"},
                    "status": {"type": "string", "enum": ["inprogress", "completed", "failed"]},
                    "limit": {"type": "number"},
                    "offset": {"type": "number"}
                }
            }),
            server: Some("muster".to_string()),
        });
        tools.push(ToolDescriptor {
            name: "workflow_execution_get".to_string(),
            description: Some("Get one workflow execution with step detail".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"execution_id": {"type": "string"}},
                "required": ["execution_id"]
            }),
            server: Some("muster".to_string()),
        });
        tools
    }

    fn owns(&self, tool: &str) -> bool {
        tool == "workflow_execution_list"
            || tool == "workflow_execution_get"
            || self.workflow_for_tool(tool).is_some()
    }

    async fn call(&self, session: Option<&str>, tool: &str, args: Value) -> Result<Value> {
        match tool {
            "workflow_execution_list" => {
                let status = match args.get("status").and_then(|v| v.as_str()) {
                    Some("inprogress") => Some(ExecutionStatus::Inprogress),
                    Some("completed") => Some(ExecutionStatus::Completed),
                    Some("failed") => Some(ExecutionStatus::Failed),
                    Some(other) => {
                        return Err(MusterError::validation(format!(
                            "unknown status '{}'",
                            other
                        )));
                    }
                    None => None,
                };
                let filter = ExecutionFilter {
                    workflow: args
                        .get("workflow")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    status,
                    limit: args.get("limit").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                    offset: args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                    ..Default::default()
                };
                let executions = self.engine.list_executions(&filter).await?;
                // Summaries only; step detail comes from workflow_execution_get.
                let summaries: Vec<Value> = executions
                    .iter()
                    .map(|execution| {
                        json!({
                            "execution_id": execution.execution_id,
                            "workflow_name": execution.workflow_name,
                            "status": execution.status,
                            "started_at": execution.started_at,
                            "duration_ms": execution.duration_ms,
                        })
                    })
                    .collect();
                Ok(json!({"executions": summaries}))
            }
            "workflow_execution_get" => {
                let id = args
                    .get("execution_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        MusterError::validation("workflow_execution_get requires 'execution_id'")
                    })?;
                let id = Uuid::parse_str(id)
                    .map_err(|e| MusterError::validation(format!("invalid execution_id: {}", e)))?;
                let execution = self.engine.get_execution(id).await?;
                Ok(serde_json::to_value(execution)?)
            }
            tool => {
                let definition = self
                    .workflow_for_tool(tool)
                    .ok_or_else(|| MusterError::not_found("workflow tool", tool))?;
                let input: HashMap<String, Value> = match args {
                    Value::Object(map) => map.into_iter().collect(),
                    Value::Null => HashMap::new(),
                    _ => {
                        return Err(MusterError::validation(
                            "workflow input must be an object",
                        ));
                    }
                };
                let execution = self
                    .engine
                    .execute(&definition, input, session, CancellationToken::new())
                    .await?;
                Ok(serde_json::to_value(execution)?)
            }
        }
    }
}

#[cfg(test)]
mod workflow_test;
