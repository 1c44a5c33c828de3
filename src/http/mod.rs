//! HTTP ingress
//!
//! The single logical MCP endpoint (JSON-RPC 2.0 over HTTP POST), the OAuth
//! callback completing browser flows, and the client metadata document for
//! providers without dynamic client registration.

pub mod session;

use crate::aggregator::Aggregator;
use crate::auth::ChallengeManager;
use crate::config::Config;
use crate::constants::{
    JSONRPC_INTERNAL_ERROR, JSONRPC_INVALID_PARAMS, JSONRPC_METHOD_NOT_FOUND,
    MCP_PROTOCOL_VERSION,
};
use crate::{MusterError, Result};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub use session::{session_from_headers, session_or_anonymous};

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub challenges: Arc<ChallengeManager>,
    pub config: Arc<Config>,
}

/// Assemble the ingress router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/healthz", get(handle_health))
        .route(&state.config.http.oauth_callback_path, get(handle_callback))
        .route(&state.config.http.cimd_path, get(handle_cimd))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown future resolves
pub async fn serve(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| MusterError::config(format!("cannot bind {}: {}", addr, e)))?;
    tracing::info!("muster listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| MusterError::internal(format!("server error: {}", e)))
}

// ---------------------------------------------------------------------------
// MCP endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn rpc_result(id: Option<Value>, result: Value) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "result": result,
    }))
}

fn rpc_error(id: Option<Value>, code: i32, message: String) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": {"code": code, "message": message},
    }))
}

async fn handle_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RpcRequest>,
) -> Response {
    let session = session_or_anonymous(&headers);
    state.aggregator.ensure_session(&session);

    // Notifications carry no id and expect no body.
    if request.method.starts_with("notifications/") {
        return StatusCode::ACCEPTED.into_response();
    }

    let id = request.id.clone();
    let result = dispatch(&state, &session, &request).await;

    match result {
        Ok(result) => rpc_result(id, result).into_response(),
        // Auth challenges are tool results, not protocol errors: the agent
        // is expected to surface the URL to the user.
        Err(MusterError::AuthRequired { server, auth_url }) => {
            let message = MusterError::AuthRequired {
                server: server.clone(),
                auth_url: auth_url.clone(),
            }
            .status_message();
            rpc_result(
                id,
                json!({
                    "isError": true,
                    "auth_required": true,
                    "server": server,
                    "auth_url": auth_url,
                    "content": [{"type": "text", "text": message}],
                }),
            )
            .into_response()
        }
        Err(e) => {
            let code = match &e {
                MusterError::Validation(_) => JSONRPC_INVALID_PARAMS,
                MusterError::NotFound { .. } => JSONRPC_METHOD_NOT_FOUND,
                _ => JSONRPC_INTERNAL_ERROR,
            };
            rpc_error(id, code, e.status_message()).into_response()
        }
    }
}

async fn dispatch(state: &AppState, session: &str, request: &RpcRequest) -> Result<Value> {
    let session = Some(session);
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {"listChanged": true},
                "resources": {},
                "prompts": {},
            },
            "serverInfo": {
                "name": "muster",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let tools = state.aggregator.list_tools(session).await;
            Ok(json!({"tools": tools}))
        }
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MusterError::validation("tools/call requires 'name'"))?;
            let args = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            let result = state.aggregator.call_tool(session, name, args).await?;
            Ok(wrap_tool_result(result))
        }
        "resources/list" => {
            let resources = state.aggregator.list_resources(session).await;
            Ok(json!({"resources": resources}))
        }
        "resources/read" => {
            let uri = request
                .params
                .get("uri")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MusterError::validation("resources/read requires 'uri'"))?;
            state.aggregator.read_resource(session, uri).await
        }
        "prompts/list" => {
            let prompts = state.aggregator.list_prompts(session).await;
            Ok(json!({"prompts": prompts}))
        }
        "prompts/get" => {
            let name = request
                .params
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MusterError::validation("prompts/get requires 'name'"))?;
            let args = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            state.aggregator.get_prompt(session, name, args).await
        }
        other => Err(MusterError::not_found("method", other)),
    }
}

/// Backing servers already answer in MCP tool-result shape; control-plane
/// tools answer plain JSON and get wrapped.
fn wrap_tool_result(result: Value) -> Value {
    if result.get("content").is_some() {
        return result;
    }
    let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": false,
    })
}

// ---------------------------------------------------------------------------
// OAuth callback and CIMD
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn handle_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        let description = query.error_description.unwrap_or_default();
        return (
            StatusCode::BAD_REQUEST,
            Html(format!(
                "<html><body><h1>Authentication failed</h1><p>{}: {}</p></body></html>",
                error, description
            )),
        )
            .into_response();
    }

    let (Some(code), Some(callback_state)) = (query.code, query.state) else {
        return (
            StatusCode::BAD_REQUEST,
            Html("<html><body><h1>Missing code or state</h1></body></html>".to_string()),
        )
            .into_response();
    };

    match state.challenges.complete(&callback_state, &code).await {
        Ok(Some(_)) => Html(
            "<html><body><h1>Authentication complete</h1>\
             <p>You can close this window and return to your agent.</p></body></html>"
                .to_string(),
        )
        .into_response(),
        // Unknown or already-completed state: idempotent no-op.
        Ok(None) => Html(
            "<html><body><h1>Already completed</h1>\
             <p>This authentication flow was already finished.</p></body></html>"
                .to_string(),
        )
        .into_response(),
        Err(e) => {
            tracing::error!("oauth callback failed: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Html(format!(
                    "<html><body><h1>Authentication failed</h1><p>{}</p></body></html>",
                    e.status_message()
                )),
            )
                .into_response()
        }
    }
}

/// Client metadata document (CIMD) for providers that cannot do dynamic
/// client registration.
async fn handle_cimd(State(state): State<AppState>) -> Json<Value> {
    let client_config = state.config.oauth_client_config();
    Json(json!({
        "client_id": client_config.client_id,
        "client_name": "muster",
        "redirect_uris": [client_config.redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": if client_config.client_secret.is_some() {
            "client_secret_post"
        } else {
            "none"
        },
    }))
}

async fn handle_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod http_test;
