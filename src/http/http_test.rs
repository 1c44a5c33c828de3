use super::*;
use crate::auth::{OAuthClientConfig, build_auth};
use crate::event::EventBus;
use axum::body::Body;
use axum::http::Request;
use tower::ServiceExt;

fn app_state() -> AppState {
    let (store, challenges, egress) = build_auth(
        OAuthClientConfig {
            client_id: "muster".to_string(),
            client_secret: None,
            redirect_uri: "http://localhost:8090/oauth/proxy/callback".to_string(),
        },
        None,
    )
    .unwrap();
    let _ = store;
    AppState {
        aggregator: Arc::new(Aggregator::new(egress, Arc::new(EventBus::new()))),
        challenges,
        config: Arc::new(Config::default()),
    }
}

async fn rpc(app: &Router, session: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json");
    if let Some(session) = session {
        request = request.header(crate::constants::SESSION_HEADER, session);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_initialize() {
    let app = router(app_state());
    let (status, body) = rpc(
        &app,
        Some("s1"),
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 1);
    assert_eq!(
        body["result"]["protocolVersion"],
        crate::constants::MCP_PROTOCOL_VERSION
    );
    assert_eq!(body["result"]["serverInfo"]["name"], "muster");
}

#[tokio::test]
async fn test_tools_list_contains_meta_tools() {
    let app = router(app_state());
    let (_, body) = rpc(
        &app,
        Some("s1"),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;

    let tools = body["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert!(names.contains(&"list_tools"));
    assert!(names.contains(&"call_tool"));
}

#[tokio::test]
async fn test_tools_call_wraps_plain_results() {
    let app = router(app_state());
    let (_, body) = rpc(
        &app,
        Some("s1"),
        json!({
            "jsonrpc": "2.0", "id": 3,
            "method": "tools/call",
            "params": {"name": "list_tools", "arguments": {}}
        }),
    )
    .await;

    assert_eq!(body["result"]["isError"], false);
    let content = body["result"]["content"].as_array().unwrap();
    assert_eq!(content[0]["type"], "text");
    assert!(content[0]["text"].as_str().unwrap().contains("list_tools"));
}

#[tokio::test]
async fn test_unknown_tool_is_rpc_error() {
    let app = router(app_state());
    let (_, body) = rpc(
        &app,
        Some("s1"),
        json!({
            "jsonrpc": "2.0", "id": 4,
            "method": "tools/call",
            "params": {"name": "nope", "arguments": {}}
        }),
    )
    .await;

    assert_eq!(
        body["error"]["code"],
        crate::constants::JSONRPC_METHOD_NOT_FOUND
    );
}

#[tokio::test]
async fn test_unknown_method() {
    let app = router(app_state());
    let (_, body) = rpc(
        &app,
        None,
        json!({"jsonrpc": "2.0", "id": 5, "method": "bogus/method"}),
    )
    .await;
    assert!(body["error"]["code"].is_number());
}

#[tokio::test]
async fn test_notifications_are_accepted_without_body() {
    let app = router(app_state());
    let (status, body) = rpc(
        &app,
        Some("s1"),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_missing_params_is_invalid() {
    let app = router(app_state());
    let (_, body) = rpc(
        &app,
        Some("s1"),
        json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call", "params": {}}),
    )
    .await;
    assert_eq!(
        body["error"]["code"],
        crate::constants::JSONRPC_INVALID_PARAMS
    );
}

#[tokio::test]
async fn test_cimd_document() {
    let app = router(app_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri(crate::constants::DEFAULT_CIMD_PATH)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let document: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(document["client_id"], "muster");
    assert!(
        document["redirect_uris"][0]
            .as_str()
            .unwrap()
            .ends_with(crate::constants::DEFAULT_OAUTH_CALLBACK_PATH)
    );
}

#[tokio::test]
async fn test_callback_requires_code_and_state() {
    let app = router(app_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri(crate::constants::DEFAULT_OAUTH_CALLBACK_PATH)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_with_unknown_state_is_noop() {
    let app = router(app_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "{}?code=abc&state=unknown",
                    crate::constants::DEFAULT_OAUTH_CALLBACK_PATH
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("Already completed"));
}

#[tokio::test]
async fn test_callback_error_from_provider() {
    let app = router(app_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "{}?error=access_denied&error_description=nope",
                    crate::constants::DEFAULT_OAUTH_CALLBACK_PATH
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_healthz() {
    let app = router(app_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
