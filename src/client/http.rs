//! Remote HTTP/SSE transport
//!
//! JSON-RPC over HTTP POST via reqwest, with optional SSE-framed responses
//! for servers declaring the SSE transport. The bearer resolved by the auth
//! pipeline travels in the request context; a 401 surfaces as auth-required
//! rather than a health failure.

use super::{JsonRpcRequest, JsonRpcResponse, McpClient, RequestContext};
use crate::error::NetworkError;
use crate::model::{HealthState, PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use crate::{MusterError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// MCP client over a remote HTTP or SSE endpoint
pub struct HttpMcpClient {
    name: String,
    url: String,
    sse: bool,
    http: reqwest::Client,
    next_id: AtomicI64,
}

impl HttpMcpClient {
    pub fn new(
        name: &str,
        url: &str,
        headers: &HashMap<String, String>,
        sse: bool,
    ) -> Result<Self> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let key = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| MusterError::config(format!("invalid header name '{}': {}", key, e)))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| MusterError::config(format!("invalid header value: {}", e)))?;
            default_headers.insert(key, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| MusterError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            sse,
            http,
            next_id: AtomicI64::new(1),
        })
    }

    async fn request(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let send = async {
            tokio::time::timeout(ctx.timeout, self.post_rpc(ctx, &request))
                .await
                .map_err(|_| MusterError::Network(NetworkError::Timeout))?
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

    async fn post_rpc(
        &self,
        ctx: &RequestContext,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        let mut builder = self
            .http
            .post(&self.url)
            .json(request)
            .header(
                reqwest::header::ACCEPT,
                if self.sse {
                    "text/event-stream, application/json"
                } else {
                    "application/json"
                },
            );
        if let Some(ref bearer) = ctx.bearer {
            builder = builder.bearer_auth(bearer);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| MusterError::Network(NetworkError::Reqwest(e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let www_authenticate = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            return Err(MusterError::Network(NetworkError::Unauthorized {
                www_authenticate,
            }));
        }
        if !status.is_success() {
            return Err(MusterError::network(format!(
                "'{}' returned HTTP {}",
                self.name, status
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            self.read_sse_response(response).await
        } else {
            response
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| MusterError::Network(NetworkError::Reqwest(e)))
        }
    }

    /// Read SSE frames until a complete JSON-RPC response arrives
    async fn read_sse_response(&self, response: reqwest::Response) -> Result<JsonRpcResponse> {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| MusterError::Network(NetworkError::Reqwest(e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Frames are separated by a blank line; data lines carry payload.
            while let Some(frame_end) = buffer.find("\n\n") {
                let frame: String = buffer[..frame_end].to_string();
                buffer.drain(..frame_end + 2);

                let data: String = frame
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(|d| d.trim_start())
                    .collect::<Vec<_>>()
                    .join("\n");
                if data.is_empty() {
                    continue;
                }
                if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(&data)
                    && (parsed.result.is_some() || parsed.error.is_some())
                {
                    return Ok(parsed);
                }
            }
        }

        Err(MusterError::mcp(format!(
            "'{}' ended the event stream without a response",
            self.name
        )))
    }
}

#[async_trait]
impl McpClient for HttpMcpClient {
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
            Err(MusterError::Network(NetworkError::Unauthorized { .. })) => {
                HealthState::AuthRequired
            }
            Err(_) => HealthState::Unhealthy,
        }
    }

    async fn close(&self) -> Result<()> {
        // Nothing to release; the connection pool drops with the client.
        Ok(())
    }
}
