//! Backing-server clients
//!
//! One uniform interface over the transports a backing MCP server can speak:
//! a local child process on stdio, or a remote HTTP/SSE endpoint. The
//! aggregator and supervisor only ever see the `McpClient` trait.

pub mod http;
pub mod stdio;

use crate::model::{
    HealthState, McpServerDefinition, PromptDescriptor, ResourceDescriptor, ToolDescriptor,
    Transport,
};
use crate::{MusterError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use http::HttpMcpClient;
pub use stdio::StdioMcpClient;

/// Per-call context: deadline, cancellation, and the bearer the auth
/// pipeline resolved for this session (if any).
#[derive(Clone)]
pub struct RequestContext {
    pub bearer: Option<String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            bearer: None,
            timeout: crate::constants::DEFAULT_CALL_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_bearer(mut self, bearer: Option<String>) -> Self {
        self.bearer = bearer;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform interface over local and remote MCP transports
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<ToolDescriptor>>;
    async fn list_resources(&self, ctx: &RequestContext) -> Result<Vec<ResourceDescriptor>>;
    async fn list_prompts(&self, ctx: &RequestContext) -> Result<Vec<PromptDescriptor>>;
    async fn call_tool(&self, ctx: &RequestContext, name: &str, args: Value) -> Result<Value>;
    async fn read_resource(&self, ctx: &RequestContext, uri: &str) -> Result<Value>;
    async fn get_prompt(&self, ctx: &RequestContext, name: &str, args: Value) -> Result<Value>;

    /// Probe liveness; a 401 is auth-required, not a health failure
    async fn ping(&self, ctx: &RequestContext) -> HealthState;

    /// Release the transport (EOF + reap for local, drop for remote)
    async fn close(&self) -> Result<()>;
}

/// Connect a client for the definition's transport variant
pub async fn connect(definition: &McpServerDefinition) -> Result<Arc<dyn McpClient>> {
    match &definition.transport {
        Transport::LocalStdio { command, args, env } => Ok(Arc::new(
            StdioMcpClient::start(&definition.name, command, args, env).await?,
        )),
        Transport::RemoteHttp { url, headers } => Ok(Arc::new(HttpMcpClient::new(
            &definition.name,
            url,
            headers,
            false,
        )?)),
        Transport::RemoteSse { url, headers } => Ok(Arc::new(HttpMcpClient::new(
            &definition.name,
            url,
            headers,
            true,
        )?)),
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC framing
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    #[allow(dead_code)]
    pub id: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[allow(dead_code)]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Unwrap the result, mapping a JSON-RPC error onto MusterError
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(MusterError::mcp(format!(
                "backing server returned error {}: {}",
                error.code, error.message
            )));
        }
        self.result
            .ok_or_else(|| MusterError::mcp("backing server returned no result"))
    }
}

/// Decode the `tools` array of a tools/list result
pub(crate) fn parse_tools(result: &Value) -> Vec<ToolDescriptor> {
    result
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_resources(result: &Value) -> Vec<ResourceDescriptor> {
    result
        .get("resources")
        .and_then(|v| v.as_array())
        .map(|resources| {
            resources
                .iter()
                .filter_map(|r| serde_json::from_value(r.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_prompts(result: &Value) -> Vec<PromptDescriptor> {
    result
        .get("prompts")
        .and_then(|v| v.as_array())
        .map(|prompts| {
            prompts
                .iter()
                .filter_map(|p| serde_json::from_value(p.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod client_test;
