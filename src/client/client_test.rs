use super::*;
use crate::error::NetworkError;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rpc_result(id: i64, result: serde_json::Value) -> serde_json::Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

#[tokio::test]
async fn test_http_list_tools() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rpc_result(
            1,
            json!({
                "tools": [
                    {"name": "get_pods", "description": "List pods", "inputSchema": {"type": "object"}},
                    {"name": "get_logs", "inputSchema": {"type": "object"}}
                ]
            }),
        )))
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(
        "k8s",
        &format!("{}/mcp", server.uri()),
        &std::collections::HashMap::new(),
        false,
    )
    .unwrap();

    let tools = client.list_tools(&RequestContext::new()).await.unwrap();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].name, "get_pods");
    assert_eq!(tools[0].description.as_deref(), Some("List pods"));
}

#[tokio::test]
async fn test_http_call_tool_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(rpc_result(1, json!({"content": [{"type": "text", "text": "ok"}]}))),
        )
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(
        "k8s",
        &format!("{}/mcp", server.uri()),
        &std::collections::HashMap::new(),
        false,
    )
    .unwrap();

    let result = client
        .call_tool(&RequestContext::new(), "get_pods", json!({"namespace": "default"}))
        .await
        .unwrap();
    assert!(result.get("content").is_some());
}

#[tokio::test]
async fn test_http_401_surfaces_challenge_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("WWW-Authenticate", "Bearer realm=\"https://idp.example/\""),
        )
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(
        "remote-server",
        &server.uri(),
        &std::collections::HashMap::new(),
        false,
    )
    .unwrap();

    let err = client
        .call_tool(&RequestContext::new(), "anything", json!({}))
        .await
        .unwrap_err();
    match err {
        crate::MusterError::Network(NetworkError::Unauthorized { www_authenticate }) => {
            assert!(www_authenticate.unwrap().contains("https://idp.example/"));
        }
        other => panic!("expected Unauthorized, got: {:?}", other),
    }

    // A 401 is auth-required, not unhealthy.
    assert_eq!(
        client.ping(&RequestContext::new()).await,
        crate::model::HealthState::AuthRequired
    );
}

#[tokio::test]
async fn test_http_5xx_is_unhealthy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(
        "remote-server",
        &server.uri(),
        &std::collections::HashMap::new(),
        false,
    )
    .unwrap();

    assert_eq!(
        client.ping(&RequestContext::new()).await,
        crate::model::HealthState::Unhealthy
    );
}

#[tokio::test]
async fn test_http_rpc_error_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "tool not found"}
        })))
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(
        "k8s",
        &server.uri(),
        &std::collections::HashMap::new(),
        false,
    )
    .unwrap();

    let err = client
        .call_tool(&RequestContext::new(), "missing", json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tool not found"));
}

#[tokio::test]
async fn test_sse_response_parsing() {
    let server = MockServer::start().await;
    let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[{\"name\":\"t1\",\"inputSchema\":{}}]}}\n\n";
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/event-stream")
                .set_body_raw(body, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(
        "sse-server",
        &server.uri(),
        &std::collections::HashMap::new(),
        true,
    )
    .unwrap();

    let tools = client.list_tools(&RequestContext::new()).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "t1");
}

#[tokio::test]
async fn test_cancelled_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_secs(10))
                .set_body_json(rpc_result(1, json!({}))),
        )
        .mount(&server)
        .await;

    let client = HttpMcpClient::new(
        "slow",
        &server.uri(),
        &std::collections::HashMap::new(),
        false,
    )
    .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let ctx = RequestContext::new().with_cancel(cancel.clone());

    let call = tokio::spawn(async move { client.call_tool(&ctx, "anything", json!({})).await });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel.cancel();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(crate::MusterError::Cancelled(_))));
}

#[tokio::test]
async fn test_stdio_client_against_shell_responder() {
    // A minimal MCP responder: answers initialize (id 1), swallows the
    // initialized notification, then answers the first tools/list (id 2).
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}\n'
read line
read line
printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{}}]}}\n'
read line
"#;

    let client = StdioMcpClient::start(
        "shell",
        "sh",
        &["-c".to_string(), script.to_string()],
        &std::collections::HashMap::new(),
    )
    .await
    .unwrap();

    let tools = client.list_tools(&RequestContext::new()).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    client.close().await.unwrap();
}

#[test]
fn test_parse_helpers_tolerate_missing_fields() {
    assert!(parse_tools(&json!({})).is_empty());
    assert!(parse_resources(&json!({"resources": "not-an-array"})).is_empty());
    let prompts = parse_prompts(&json!({"prompts": [{"name": "p"}]}));
    assert_eq!(prompts.len(), 1);
}
