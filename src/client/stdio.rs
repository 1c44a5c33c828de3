//! Local stdio transport
//!
//! Spawns the configured command and speaks line-delimited JSON-RPC over its
//! standard streams. Closing sends EOF and reaps the child with a bounded
//! grace period before killing it.

use super::{JsonRpcRequest, JsonRpcResponse, McpClient, RequestContext};
use crate::model::{HealthState, PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use crate::{MusterError, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// MCP client over a local child process
pub struct StdioMcpClient {
    name: String,
    process: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
    next_id: Mutex<i64>,
}

impl StdioMcpClient {
    /// Spawn the command and run the MCP initialize handshake
    pub async fn start(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut process = cmd.spawn().map_err(|e| {
            MusterError::mcp(format!("failed to spawn MCP server '{}': {}", name, e))
        })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| MusterError::mcp("failed to get child stdin"))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| MusterError::mcp("failed to get child stdout"))?;

        let client = Self {
            name: name.to_string(),
            process: Mutex::new(Some(process)),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: Mutex::new(1),
        };

        client.initialize().await?;

        tracing::info!("started MCP server '{}' via {}", name, command);
        Ok(client)
    }

    async fn initialize(&self) -> Result<()> {
        let request = JsonRpcRequest::new(
            self.next_id().await,
            "initialize",
            json!({
                "protocolVersion": crate::constants::MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "muster",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        );
        self.send_request(request).await?.into_result()?;

        self.send_notification(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        }))
        .await
    }

    async fn request(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let request = JsonRpcRequest::new(self.next_id().await, method, params);

        let send = async {
            tokio::time::timeout(ctx.timeout, self.send_request(request))
                .await
                .map_err(|_| MusterError::Network(crate::error::NetworkError::Timeout))?
        };

        tokio::select! {
            result = send => result?.into_result(),
            _ = ctx.cancel.cancelled() => {
                Err(MusterError::Cancelled(format!(
                    "call to '{}' cancelled", self.name
                )))
            }
        }
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let request_json = serde_json::to_string(&request)?;

        {
            let mut stdin = self.stdin.lock().await;
            let stdin = stdin
                .as_mut()
                .ok_or_else(|| MusterError::mcp(format!("'{}' is closed", self.name)))?;
            stdin.write_all(request_json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
        }

        let mut stdout = self.stdout.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            let read = stdout.read_line(&mut line).await?;
            if read == 0 {
                return Err(MusterError::mcp(format!(
                    "'{}' closed its stdout",
                    self.name
                )));
            }
            if line.trim().is_empty() {
                continue;
            }
            // Skip server-initiated notifications while waiting for the reply.
            let parsed: JsonRpcResponse = match serde_json::from_str(&line) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            if parsed.id == Some(request.id) || parsed.id.is_none() && parsed.error.is_some() {
                return Ok(parsed);
            }
        }
    }

    async fn send_notification(&self, notification: Value) -> Result<()> {
        let notification_json = serde_json::to_string(&notification)?;

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| MusterError::mcp(format!("'{}' is closed", self.name)))?;
        stdin.write_all(notification_json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn next_id(&self) -> i64 {
        let mut id = self.next_id.lock().await;
        let current = *id;
        *id += 1;
        current
    }
}

#[async_trait]
impl McpClient for StdioMcpClient {
    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<ToolDescriptor>> {
        let result = self.request(ctx, "tools/list", json!({})).await?;
        Ok(super::parse_tools(&result))
    }

    async fn list_resources(&self, ctx: &RequestContext) -> Result<Vec<ResourceDescriptor>> {
        let result = self.request(ctx, "resources/list", json!({})).await?;
        Ok(super::parse_resources(&result))
    }

    async fn list_prompts(&self, ctx: &RequestContext) -> Result<Vec<PromptDescriptor>> {
        let result = self.request(ctx, "prompts/list", json!({})).await?;
        Ok(super::parse_prompts(&result))
    }

    async fn call_tool(&self, ctx: &RequestContext, name: &str, args: Value) -> Result<Value> {
        self.request(
            ctx,
            "tools/call",
            json!({"name": name, "arguments": args}),
        )
        .await
    }

    async fn read_resource(&self, ctx: &RequestContext, uri: &str) -> Result<Value> {
        self.request(ctx, "resources/read", json!({"uri": uri}))
            .await
    }

    async fn get_prompt(&self, ctx: &RequestContext, name: &str, args: Value) -> Result<Value> {
        self.request(
            ctx,
            "prompts/get",
            json!({"name": name, "arguments": args}),
        )
        .await
    }

    async fn ping(&self, ctx: &RequestContext) -> HealthState {
        let probe = ctx
            .clone()
            .with_timeout(crate::constants::HEALTH_PROBE_TIMEOUT);
        match self.request(&probe, "tools/list", json!({})).await {
            Ok(_) => HealthState::Healthy,
            Err(_) => HealthState::Unhealthy,
        }
    }

    async fn close(&self) -> Result<()> {
        // EOF first: dropping stdin asks the server to exit cleanly.
        self.stdin.lock().await.take();

        let mut guard = self.process.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(crate::constants::CHILD_SHUTDOWN_GRACE, child.wait()).await
            {
                Ok(Ok(status)) => {
                    tracing::debug!("MCP server '{}' exited: {}", self.name, status);
                }
                Ok(Err(e)) => {
                    tracing::warn!("error reaping MCP server '{}': {}", self.name, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "MCP server '{}' did not exit within grace period, killing",
                        self.name
                    );
                    let _ = child.kill().await;
                }
            }
        }
        Ok(())
    }
}
