//! Service drivers
//!
//! A driver knows how to actually start, stop, and probe one kind of
//! service: an MCP backing server (owning its client connection and its
//! aggregator registration), or a ServiceClass instance whose lifecycle is
//! tool calls through the internal aggregator path.

use crate::aggregator::{Aggregator, ToolDispatcher};
use crate::client::{self, McpClient, RequestContext};
use crate::model::{
    HealthState, LifecycleTool, McpServerDefinition, ServiceClassDefinition, ServiceInstance,
};
use crate::registry::HandlerRegistry;
use crate::workflow::template::{lookup_path, render_args};
use crate::{MusterError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Start/stop/probe behavior behind the per-service state machine
#[async_trait]
pub trait ServiceDriver: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn probe(&self) -> HealthState;

    /// Running (local) vs Connected (remote) once healthy
    fn is_local(&self) -> bool;
}

// ---------------------------------------------------------------------------
// MCP backing servers
// ---------------------------------------------------------------------------

/// Driver for one MCPServer definition: connects the transport, discovers
/// the catalog, and keeps the aggregator registration in sync.
pub struct McpServerDriver {
    definition: McpServerDefinition,
    registry: Arc<HandlerRegistry>,
    client: Mutex<Option<Arc<dyn McpClient>>>,
}

impl McpServerDriver {
    pub fn new(definition: McpServerDefinition, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            definition,
            registry,
            client: Mutex::new(None),
        }
    }

    fn aggregator(&self) -> Option<Arc<Aggregator>> {
        self.registry
            .get::<Aggregator>(crate::constants::HANDLER_AGGREGATOR)
    }
}

#[async_trait]
impl ServiceDriver for McpServerDriver {
    async fn start(&self) -> Result<()> {
        let connected = client::connect(&self.definition).await?;

        // Discover the catalog. A 401 here is fine: the server registers
        // with an empty catalog and fills in after the session
        // authenticates.
        let ctx = RequestContext::new();
        let (tools, resources, prompts) = match connected.list_tools(&ctx).await {
            Ok(tools) => {
                let resources = connected.list_resources(&ctx).await.unwrap_or_default();
                let prompts = connected.list_prompts(&ctx).await.unwrap_or_default();
                (tools, resources, prompts)
            }
            Err(MusterError::Network(crate::error::NetworkError::Unauthorized { .. })) => {
                (vec![], vec![], vec![])
            }
            Err(e) => {
                let _ = connected.close().await;
                return Err(e);
            }
        };

        if let Some(aggregator) = self.aggregator() {
            aggregator
                .register_server(
                    self.definition.clone(),
                    connected.clone(),
                    tools,
                    resources,
                    prompts,
                )
                .await?;
        }

        *self.client.lock().await = Some(connected);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(aggregator) = self.aggregator() {
            aggregator.deregister_server(&self.definition.name).await;
        }
        if let Some(client) = self.client.lock().await.take() {
            // Broken pipes while closing a dying child are expected noise.
            if let Err(e) = client.close().await {
                tracing::debug!("close of '{}' reported: {}", self.definition.name, e);
            }
        }
        Ok(())
    }

    async fn probe(&self) -> HealthState {
        let client = self.client.lock().await.clone();
        match client {
            Some(client) => client.ping(&RequestContext::new()).await,
            None => HealthState::Unknown,
        }
    }

    fn is_local(&self) -> bool {
        self.definition.transport.is_local()
    }
}

// ---------------------------------------------------------------------------
// ServiceClass instances
// ---------------------------------------------------------------------------

/// Driver for a ServiceClass instance. Lifecycle operations are tool calls
/// through the session-less aggregator path; the response mapping extracts
/// health from the health tool's result.
pub struct InstanceDriver {
    class: ServiceClassDefinition,
    instance: ServiceInstance,
    registry: Arc<HandlerRegistry>,
}

impl InstanceDriver {
    pub fn new(
        class: ServiceClassDefinition,
        instance: ServiceInstance,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            class,
            instance,
            registry,
        }
    }

    fn dispatcher(&self) -> Result<Arc<dyn ToolDispatcher>> {
        self.registry
            .get::<crate::aggregator::ArcDispatcher>(crate::constants::HANDLER_TOOL_DISPATCHER)
            .map(|d| d as Arc<dyn ToolDispatcher>)
            .ok_or_else(|| MusterError::internal("tool dispatcher not registered"))
    }

    /// Instance args plus the instance name, the scope lifecycle templates
    /// render against.
    fn template_scope(&self) -> HashMap<String, Value> {
        let mut scope = self.instance.args.clone();
        scope.insert("name".to_string(), Value::String(self.instance.name.clone()));
        scope
    }

    async fn call_lifecycle(
        &self,
        lifecycle: &LifecycleTool,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let dispatcher = self.dispatcher()?;
        let scope = self.template_scope();
        let (args, _warnings) = render_args(&lifecycle.args, &scope)?;

        let call = dispatcher.dispatch_tool(None, &lifecycle.tool, Value::Object(args));
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, call).await.map_err(|_| {
                MusterError::Network(crate::error::NetworkError::Timeout)
            })?,
            None => call.await,
        }
    }

    fn timeout_secs(value: Option<u64>) -> Option<Duration> {
        value.map(Duration::from_secs)
    }
}

#[async_trait]
impl ServiceDriver for InstanceDriver {
    async fn start(&self) -> Result<()> {
        let timeout =
            Self::timeout_secs(self.class.timeout.as_ref().and_then(|t| t.create_secs));
        self.call_lifecycle(&self.class.lifecycle_tools.start, timeout)
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let timeout =
            Self::timeout_secs(self.class.timeout.as_ref().and_then(|t| t.delete_secs));
        self.call_lifecycle(&self.class.lifecycle_tools.stop, timeout)
            .await?;
        Ok(())
    }

    async fn probe(&self) -> HealthState {
        let Some(health_tool) = &self.class.lifecycle_tools.health_check else {
            // No health tool: a started instance counts as healthy.
            return HealthState::Healthy;
        };

        let timeout = Self::timeout_secs(
            self.class
                .timeout
                .as_ref()
                .and_then(|t| t.health_check_secs),
        )
        .unwrap_or(crate::constants::HEALTH_PROBE_TIMEOUT);

        let result = match self.call_lifecycle(health_tool, Some(timeout)).await {
            Ok(result) => result,
            Err(_) => return HealthState::Unhealthy,
        };

        // Exact-match expectations from the health config, then the
        // response mapping's health path.
        if let Some(expect) = self
            .class
            .health_check
            .as_ref()
            .and_then(|config| config.expect.as_ref())
        {
            for (path, expected) in &expect.json_path {
                if lookup_path(&result, path) != Some(expected.clone()) {
                    return HealthState::Unhealthy;
                }
            }
            return HealthState::Healthy;
        }

        if let Some(mapping) = &health_tool.response_mapping
            && let Some(ref health_path) = mapping.health
        {
            return match lookup_path(&result, health_path) {
                Some(Value::Bool(true)) => HealthState::Healthy,
                Some(Value::String(s)) if s == "healthy" || s == "ok" => HealthState::Healthy,
                _ => HealthState::Unhealthy,
            };
        }

        HealthState::Healthy
    }

    fn is_local(&self) -> bool {
        true
    }
}
