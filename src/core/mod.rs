//! Core management operations
//!
//! The `core_*` tool family: CRUD over the three declarative resource
//! kinds, lifecycle verbs for services, and auth status. Exposed through
//! the aggregator like any other tool so every interface (agent, CLI)
//! reaches the same operations.

pub mod runtime;

pub use runtime::{Runtime, create_runtime};

use crate::aggregator::BuiltinToolProvider;
use crate::auth::EgressAuthenticator;
use crate::config::{DefinitionKind, DefinitionStore};
use crate::model::{
    McpServerDefinition, ServiceClassDefinition, ServiceInstance, StopReason, ToolDescriptor,
    WorkflowDefinition, validate_args,
};
use crate::reconciler::Reconciler;
use crate::supervisor::Supervisor;
use crate::{MusterError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything the management operations need to reach
pub struct Dependencies {
    pub definitions: Arc<DefinitionStore>,
    pub supervisor: Arc<Supervisor>,
    pub reconciler: Arc<Reconciler>,
    pub egress: Arc<EgressAuthenticator>,
}

/// Serves the `core_*` tools through the aggregator
pub struct CoreToolProvider {
    deps: Arc<Dependencies>,
}

/// (name, description, argument schema) for every operation
fn operation_table() -> Vec<(&'static str, &'static str, Value)> {
    let definition_schema = json!({
        "type": "object",
        "description": "Full resource definition"
    });
    let name_schema = json!({
        "type": "object",
        "properties": {"name": {"type": "string"}},
        "required": ["name"]
    });
    let empty_schema = json!({"type": "object", "properties": {}});

    let mut table = Vec::new();
    for kind in ["mcpserver", "serviceclass", "workflow"] {
        table.push((
            match kind {
                "mcpserver" => "core_mcpserver_create",
                "serviceclass" => "core_serviceclass_create",
                _ => "core_workflow_create",
            },
            "Create a resource from its definition",
            definition_schema.clone(),
        ));
        table.push((
            match kind {
                "mcpserver" => "core_mcpserver_update",
                "serviceclass" => "core_serviceclass_update",
                _ => "core_workflow_update",
            },
            "Update an existing resource definition",
            definition_schema.clone(),
        ));
        table.push((
            match kind {
                "mcpserver" => "core_mcpserver_delete",
                "serviceclass" => "core_serviceclass_delete",
                _ => "core_workflow_delete",
            },
            "Delete a resource by name",
            name_schema.clone(),
        ));
        table.push((
            match kind {
                "mcpserver" => "core_mcpserver_validate",
                "serviceclass" => "core_serviceclass_validate",
                _ => "core_workflow_validate",
            },
            "Validate a definition without applying it",
            definition_schema.clone(),
        ));
        table.push((
            match kind {
                "mcpserver" => "core_mcpserver_list",
                "serviceclass" => "core_serviceclass_list",
                _ => "core_workflow_list",
            },
            "List resources of this kind",
            empty_schema.clone(),
        ));
        table.push((
            match kind {
                "mcpserver" => "core_mcpserver_get",
                "serviceclass" => "core_serviceclass_get",
                _ => "core_workflow_get",
            },
            "Get one resource by name",
            name_schema.clone(),
        ));
    }

    table.push((
        "core_service_create",
        "Create a service instance from a ServiceClass",
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "serviceClass": {"type": "string"},
                "args": {"type": "object"}
            },
            "required": ["name", "serviceClass"]
        }),
    ));
    table.push(("core_service_delete", "Stop and remove a service", name_schema.clone()));
    table.push(("core_service_start", "Start a service", name_schema.clone()));
    table.push((
        "core_service_stop",
        "Stop a service and its dependents",
        name_schema.clone(),
    ));
    table.push(("core_service_restart", "Restart a service", name_schema.clone()));
    table.push(("core_service_list", "List all supervised services", empty_schema.clone()));
    table.push(("core_service_get", "Get one service's runtime state", name_schema.clone()));
    table.push((
        "core_auth_status",
        "Authentication status for every configured endpoint",
        empty_schema,
    ));

    table
}

impl CoreToolProvider {
    pub fn new(deps: Dependencies) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    fn require_name(args: &Value) -> Result<String> {
        args.get("name")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| MusterError::validation("'name' is required"))
    }

    // -- MCPServer ----------------------------------------------------------

    async fn mcpserver_create(&self, args: Value, must_exist: bool) -> Result<Value> {
        let definition: McpServerDefinition = serde_json::from_value(args)
            .map_err(|e| MusterError::validation(format!("invalid definition: {}", e)))?;
        definition.validate()?;

        let exists = self.deps.definitions.get_mcp_server(&definition.name).is_some();
        if must_exist && !exists {
            return Err(MusterError::not_found("MCPServer", &definition.name));
        }
        if !must_exist && exists {
            return Err(MusterError::validation(format!(
                "MCPServer '{}' already exists",
                definition.name
            )));
        }

        let name = definition.name.clone();
        self.deps.definitions.put_mcp_server(definition)?;
        self.deps
            .reconciler
            .trigger_reconcile(DefinitionKind::McpServer, &name);
        Ok(json!({"name": name}))
    }

    async fn mcpserver_delete(&self, args: Value) -> Result<Value> {
        let name = Self::require_name(&args)?;
        self.deps.definitions.delete_mcp_server(&name)?;
        self.deps
            .reconciler
            .trigger_reconcile(DefinitionKind::McpServer, &name);
        Ok(json!({"deleted": name}))
    }

    // -- ServiceClass -------------------------------------------------------

    async fn serviceclass_create(&self, args: Value, must_exist: bool) -> Result<Value> {
        let definition: ServiceClassDefinition = serde_json::from_value(args)
            .map_err(|e| MusterError::validation(format!("invalid definition: {}", e)))?;
        definition.validate()?;

        let exists = self
            .deps
            .definitions
            .get_service_class(&definition.name)
            .is_some();
        if must_exist && !exists {
            return Err(MusterError::not_found("ServiceClass", &definition.name));
        }
        if !must_exist && exists {
            return Err(MusterError::validation(format!(
                "ServiceClass '{}' already exists",
                definition.name
            )));
        }

        let name = definition.name.clone();
        self.deps.definitions.put_service_class(definition)?;
        self.deps
            .reconciler
            .trigger_reconcile(DefinitionKind::ServiceClass, &name);
        Ok(json!({"name": name}))
    }

    // -- Workflow -----------------------------------------------------------

    async fn workflow_create(&self, args: Value, must_exist: bool) -> Result<Value> {
        let definition: WorkflowDefinition = serde_json::from_value(args)
            .map_err(|e| MusterError::validation(format!("invalid definition: {}", e)))?;
        definition.validate()?;

        let exists = self.deps.definitions.get_workflow(&definition.name).is_some();
        if must_exist && !exists {
            return Err(MusterError::not_found("Workflow", &definition.name));
        }
        if !must_exist && exists {
            return Err(MusterError::validation(format!(
                "Workflow '{}' already exists",
                definition.name
            )));
        }

        let name = definition.name.clone();
        self.deps.definitions.put_workflow(definition)?;
        self.deps
            .reconciler
            .trigger_reconcile(DefinitionKind::Workflow, &name);
        Ok(json!({"name": name}))
    }

    // -- Services -----------------------------------------------------------

    async fn service_create(&self, args: Value) -> Result<Value> {
        let name = Self::require_name(&args)?;
        let class_name = args
            .get("serviceClass")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MusterError::validation("'serviceClass' is required"))?;

        let class = self
            .deps
            .definitions
            .get_service_class(class_name)
            .ok_or_else(|| MusterError::not_found("ServiceClass", class_name))?;
        if !self.class_available(&class).await {
            return Err(MusterError::DependencyUnsatisfied(format!(
                "ServiceClass '{}' has unavailable lifecycle tools",
                class_name
            )));
        }

        let instance_args: HashMap<String, Value> = args
            .get("args")
            .and_then(|v| v.as_object())
            .map(|map| map.clone().into_iter().collect())
            .unwrap_or_default();
        let validated = validate_args(&class.args, &instance_args)?;

        let instance = ServiceInstance {
            name: name.clone(),
            class_name: class_name.to_string(),
            args: validated,
            created_at: Utc::now(),
        };

        self.deps.supervisor.add_instance(class, instance, true).await?;
        Ok(json!({"name": name, "serviceClass": class_name}))
    }

    /// A ServiceClass is available when its lifecycle tools resolve
    async fn class_available(&self, class: &ServiceClassDefinition) -> bool {
        let Some(dispatcher) = self
            .deps
            .supervisor
            .registry()
            .get::<crate::aggregator::ArcDispatcher>(crate::constants::HANDLER_TOOL_DISPATCHER)
        else {
            return false;
        };
        use crate::aggregator::ToolDispatcher;
        let Ok(tools) = dispatcher.dispatch_list_tools(None).await else {
            return false;
        };
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let mut required = vec![class.lifecycle_tools.start.tool.as_str()];
        required.push(class.lifecycle_tools.stop.tool.as_str());
        required
            .into_iter()
            .all(|tool| names.contains(&tool))
    }

    async fn service_status(&self, name: &str) -> Result<Value> {
        let status = self
            .deps
            .supervisor
            .status(name)
            .ok_or_else(|| MusterError::not_found("service", name))?;
        Ok(serde_json::to_value(status)?)
    }

    // -- Auth ---------------------------------------------------------------

    async fn auth_status(&self, session: Option<&str>) -> Result<Value> {
        let session = session.unwrap_or(crate::constants::ANONYMOUS_SESSION);
        let mut statuses = Vec::new();
        for definition in self.deps.definitions.list_mcp_servers() {
            statuses.push(self.deps.egress.auth_status(session, &definition).await);
        }
        Ok(json!({"endpoints": statuses}))
    }
}

#[async_trait]
impl BuiltinToolProvider for CoreToolProvider {
    fn provider_name(&self) -> &str {
        "core"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        operation_table()
            .into_iter()
            .map(|(name, description, schema)| ToolDescriptor {
                name: name.to_string(),
                description: Some(description.to_string()),
                input_schema: schema,
                server: Some("muster".to_string()),
            })
            .collect()
    }

    fn owns(&self, tool: &str) -> bool {
        operation_table().iter().any(|(name, _, _)| *name == tool)
    }

    async fn call(&self, session: Option<&str>, tool: &str, args: Value) -> Result<Value> {
        match tool {
            // MCPServer
            "core_mcpserver_create" => self.mcpserver_create(args, false).await,
            "core_mcpserver_update" => self.mcpserver_create(args, true).await,
            "core_mcpserver_delete" => self.mcpserver_delete(args).await,
            "core_mcpserver_validate" => {
                let definition: McpServerDefinition = serde_json::from_value(args)
                    .map_err(|e| MusterError::validation(format!("invalid definition: {}", e)))?;
                definition.validate()?;
                Ok(json!({"valid": true, "name": definition.name}))
            }
            "core_mcpserver_list" => {
                Ok(json!({"mcpServers": self.deps.definitions.list_mcp_servers()}))
            }
            "core_mcpserver_get" => {
                let name = Self::require_name(&args)?;
                let definition = self
                    .deps
                    .definitions
                    .get_mcp_server(&name)
                    .ok_or_else(|| MusterError::not_found("MCPServer", &name))?;
                Ok(serde_json::to_value(definition)?)
            }

            // ServiceClass
            "core_serviceclass_create" => self.serviceclass_create(args, false).await,
            "core_serviceclass_update" => self.serviceclass_create(args, true).await,
            "core_serviceclass_delete" => {
                let name = Self::require_name(&args)?;
                self.deps.definitions.delete_service_class(&name)?;
                Ok(json!({"deleted": name}))
            }
            "core_serviceclass_validate" => {
                let definition: ServiceClassDefinition = serde_json::from_value(args)
                    .map_err(|e| MusterError::validation(format!("invalid definition: {}", e)))?;
                definition.validate()?;
                Ok(json!({"valid": true, "name": definition.name}))
            }
            "core_serviceclass_list" => {
                Ok(json!({"serviceClasses": self.deps.definitions.list_service_classes()}))
            }
            "core_serviceclass_get" => {
                let name = Self::require_name(&args)?;
                let definition = self
                    .deps
                    .definitions
                    .get_service_class(&name)
                    .ok_or_else(|| MusterError::not_found("ServiceClass", &name))?;
                Ok(serde_json::to_value(definition)?)
            }

            // Workflow
            "core_workflow_create" => self.workflow_create(args, false).await,
            "core_workflow_update" => self.workflow_create(args, true).await,
            "core_workflow_delete" => {
                let name = Self::require_name(&args)?;
                self.deps.definitions.delete_workflow(&name)?;
                self.deps
                    .reconciler
                    .trigger_reconcile(DefinitionKind::Workflow, &name);
                Ok(json!({"deleted": name}))
            }
            "core_workflow_validate" => {
                let definition: WorkflowDefinition = serde_json::from_value(args)
                    .map_err(|e| MusterError::validation(format!("invalid definition: {}", e)))?;
                definition.validate()?;
                Ok(json!({"valid": true, "name": definition.name}))
            }
            "core_workflow_list" => {
                Ok(json!({"workflows": self.deps.definitions.list_workflows()}))
            }
            "core_workflow_get" => {
                let name = Self::require_name(&args)?;
                let definition = self
                    .deps
                    .definitions
                    .get_workflow(&name)
                    .ok_or_else(|| MusterError::not_found("Workflow", &name))?;
                Ok(serde_json::to_value(definition)?)
            }

            // Services
            "core_service_create" => self.service_create(args).await,
            "core_service_delete" => {
                let name = Self::require_name(&args)?;
                self.deps.supervisor.remove_service(&name).await?;
                Ok(json!({"deleted": name}))
            }
            "core_service_start" => {
                let name = Self::require_name(&args)?;
                if !self.deps.supervisor.is_supervised(&name) {
                    return Err(MusterError::not_found("service", &name));
                }
                self.deps.supervisor.start_service(&name, None).await;
                self.service_status(&name).await
            }
            "core_service_stop" => {
                let name = Self::require_name(&args)?;
                if !self.deps.supervisor.is_supervised(&name) {
                    return Err(MusterError::not_found("service", &name));
                }
                self.deps
                    .supervisor
                    .stop_service(&name, StopReason::Manual)
                    .await;
                self.service_status(&name).await
            }
            "core_service_restart" => {
                let name = Self::require_name(&args)?;
                if !self.deps.supervisor.is_supervised(&name) {
                    return Err(MusterError::not_found("service", &name));
                }
                self.deps.supervisor.restart_service(&name).await;
                self.service_status(&name).await
            }
            "core_service_list" => {
                Ok(json!({"services": self.deps.supervisor.statuses()}))
            }
            "core_service_get" => {
                let name = Self::require_name(&args)?;
                self.service_status(&name).await
            }

            // Auth
            "core_auth_status" => self.auth_status(session).await,

            other => Err(MusterError::not_found("tool", other)),
        }
    }
}
