use super::*;
use crate::auth::{OAuthClientConfig, build_auth};
use crate::client::RequestContext;
use crate::event::{BackpressurePolicy, EventBus};
use crate::model::{AuthPolicy, HealthState, Transport};
use serde_json::json;

/// Scriptable backing-server client
struct FakeClient {
    tools: Vec<ToolDescriptor>,
    unauthorized: bool,
}

impl FakeClient {
    fn with_tools(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            tools: names
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.to_string(),
                    description: Some(format!("{} tool", name)),
                    input_schema: json!({"type": "object"}),
                    server: None,
                })
                .collect(),
            unauthorized: false,
        })
    }

    fn unauthorized(names: &[&str]) -> Arc<Self> {
        let mut client = Self::with_tools(names);
        Arc::get_mut(&mut client).unwrap().unauthorized = true;
        client
    }
}

#[async_trait]
impl McpClient for FakeClient {
    async fn list_tools(&self, _ctx: &RequestContext) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn list_resources(&self, _ctx: &RequestContext) -> Result<Vec<ResourceDescriptor>> {
        Ok(vec![])
    }

    async fn list_prompts(&self, _ctx: &RequestContext) -> Result<Vec<PromptDescriptor>> {
        Ok(vec![])
    }

    async fn call_tool(&self, ctx: &RequestContext, name: &str, args: Value) -> Result<Value> {
        if self.unauthorized && ctx.bearer.is_none() {
            return Err(MusterError::Network(NetworkError::Unauthorized {
                www_authenticate: Some(
                    r#"Bearer realm="https://idp.example/", scope="openid""#.to_string(),
                ),
            }));
        }
        Ok(json!({"tool": name, "args": args, "bearer": ctx.bearer}))
    }

    async fn read_resource(&self, _ctx: &RequestContext, _uri: &str) -> Result<Value> {
        Ok(json!({}))
    }

    async fn get_prompt(&self, _ctx: &RequestContext, _name: &str, _args: Value) -> Result<Value> {
        Ok(json!({}))
    }

    async fn ping(&self, _ctx: &RequestContext) -> HealthState {
        HealthState::Healthy
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn definition(name: &str, prefix: Option<&str>, auth: Option<AuthPolicy>) -> McpServerDefinition {
    McpServerDefinition {
        name: name.to_string(),
        description: None,
        transport: Transport::RemoteHttp {
            url: "https://mcp.example/mcp".to_string(),
            headers: HashMap::new(),
        },
        tool_prefix: prefix.map(|p| p.to_string()),
        auto_start: false,
        auth,
        health: None,
        dependencies: vec![],
    }
}

fn aggregator() -> (Arc<Aggregator>, Arc<EventBus>) {
    let (_, _, egress) = build_auth(
        OAuthClientConfig {
            client_id: "muster".to_string(),
            client_secret: None,
            redirect_uri: "http://localhost:8090/oauth/proxy/callback".to_string(),
        },
        None,
    )
    .unwrap();
    let bus = Arc::new(EventBus::new());
    (Arc::new(Aggregator::new(egress, bus.clone())), bus)
}

async fn register(
    aggregator: &Arc<Aggregator>,
    def: McpServerDefinition,
    client: Arc<FakeClient>,
) {
    let tools = client.tools.clone();
    aggregator
        .register_server(def, client, tools, vec![], vec![])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_catalog_contains_prefixed_and_meta_tools() {
    let (agg, _) = aggregator();
    register(
        &agg,
        definition("k8s", Some("k8s"), None),
        FakeClient::with_tools(&["get_pods", "get_logs"]),
    )
    .await;

    let tools = agg.list_tools(Some("s1")).await;
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();

    assert!(names.contains(&"k8s_get_pods"));
    assert!(names.contains(&"k8s_get_logs"));
    assert!(names.contains(&"list_tools"));
    assert!(names.contains(&"filter_tools"));
    assert!(names.contains(&"describe_tool"));
    assert!(names.contains(&"call_tool"));
}

#[tokio::test]
async fn test_collision_rejected_at_registration() {
    let (agg, _) = aggregator();
    register(
        &agg,
        definition("a", Some("x"), None),
        FakeClient::with_tools(&["get_pods"]),
    )
    .await;

    let client = FakeClient::with_tools(&["get_pods"]);
    let tools = client.tools.clone();
    let err = agg
        .register_server(definition("b", Some("x"), None), client, tools, vec![], vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("collides"));
    assert!(!agg.is_registered("b"));
}

#[tokio::test]
async fn test_call_tool_strips_prefix() {
    let (agg, _) = aggregator();
    register(
        &agg,
        definition("k8s", Some("k8s"), None),
        FakeClient::with_tools(&["get_pods"]),
    )
    .await;

    let result = agg
        .call_tool(Some("s1"), "k8s_get_pods", json!({"namespace": "default"}))
        .await
        .unwrap();
    assert_eq!(result["tool"], "get_pods");
    assert_eq!(result["args"]["namespace"], "default");
}

#[tokio::test]
async fn test_unknown_tool_not_found() {
    let (agg, _) = aggregator();
    let err = agg
        .call_tool(Some("s1"), "nope", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, MusterError::NotFound { .. }));
}

#[tokio::test]
async fn test_register_deregister_events() {
    let (agg, bus) = aggregator();
    let mut sub = bus.subscribe("watcher", BackpressurePolicy::Block);

    register(
        &agg,
        definition("k8s", Some("k8s"), None),
        FakeClient::with_tools(&["get_pods"]),
    )
    .await;

    let event = sub.recv().await.unwrap();
    match event.payload {
        EventPayload::ToolUpdate(update) => {
            assert_eq!(update.kind, ToolUpdateKind::ServerRegistered);
            assert_eq!(update.server, "k8s");
            assert_eq!(update.tools, vec!["k8s_get_pods"]);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    agg.deregister_server("k8s").await;
    let event = sub.recv().await.unwrap();
    match event.payload {
        EventPayload::ToolUpdate(update) => {
            assert_eq!(update.kind, ToolUpdateKind::ServerDeregistered);
            assert_eq!(update.tools, vec!["k8s_get_pods"]);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    // Deregistered server's tools are gone from the catalog.
    let tools = agg.list_tools(Some("s1")).await;
    assert!(!tools.iter().any(|t| t.name == "k8s_get_pods"));
}

#[tokio::test]
async fn test_tools_updated_event() {
    let (agg, bus) = aggregator();
    register(
        &agg,
        definition("k8s", Some("k8s"), None),
        FakeClient::with_tools(&["get_pods"]),
    )
    .await;

    let mut sub = bus.subscribe("watcher", BackpressurePolicy::Block);
    agg.update_server_tools(
        "k8s",
        vec![ToolDescriptor {
            name: "get_events".to_string(),
            description: None,
            input_schema: json!({}),
            server: None,
        }],
    )
    .await
    .unwrap();

    let event = sub.recv().await.unwrap();
    match event.payload {
        EventPayload::ToolUpdate(update) => {
            assert_eq!(update.kind, ToolUpdateKind::ToolsUpdated);
            assert_eq!(update.tools, vec!["k8s_get_events"]);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let tools = agg.list_tools(Some("s1")).await;
    assert!(tools.iter().any(|t| t.name == "k8s_get_events"));
    assert!(!tools.iter().any(|t| t.name == "k8s_get_pods"));
}

#[tokio::test]
async fn test_auth_gated_server_invisible_but_challengeable() {
    let (agg, _) = aggregator();
    register(
        &agg,
        definition(
            "remote-server",
            Some("remote"),
            Some(AuthPolicy {
                issuer_url: Some("https://idp.example/".to_string()),
                ..Default::default()
            }),
        ),
        FakeClient::unauthorized(&["query"]),
    )
    .await;

    // Not listed: the session holds no token for the issuer.
    let tools = agg.list_tools(Some("s1")).await;
    assert!(!tools.iter().any(|t| t.name == "remote_query"));

    // Calling it is not tool-not-found: it yields a challenge.
    let err = agg
        .call_tool(Some("s1"), "remote_query", json!({}))
        .await
        .unwrap_err();
    match err {
        MusterError::AuthRequired { server, auth_url } => {
            assert_eq!(server, "remote-server");
            assert!(auth_url.unwrap().starts_with("https://idp.example/auth?"));
        }
        other => panic!("expected AuthRequired, got {:?}", other),
    }
}

struct FakeProvider;

#[async_trait]
impl BuiltinToolProvider for FakeProvider {
    fn provider_name(&self) -> &str {
        "fake"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "core_service_list".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            server: Some("muster".to_string()),
        }]
    }

    fn owns(&self, tool: &str) -> bool {
        tool == "core_service_list"
    }

    async fn call(&self, _session: Option<&str>, tool: &str, _args: Value) -> Result<Value> {
        Ok(json!({"called": tool}))
    }
}

#[tokio::test]
async fn test_builtin_provider_dispatch() {
    let (agg, _) = aggregator();
    agg.add_provider(Arc::new(FakeProvider));

    let tools = agg.list_tools(Some("s1")).await;
    assert!(tools.iter().any(|t| t.name == "core_service_list"));

    let result = agg
        .call_tool(Some("s1"), "core_service_list", json!({}))
        .await
        .unwrap();
    assert_eq!(result["called"], "core_service_list");
}

#[tokio::test]
async fn test_meta_tools() {
    let (agg, _) = aggregator();
    register(
        &agg,
        definition("k8s", Some("k8s"), None),
        FakeClient::with_tools(&["get_pods"]),
    )
    .await;

    let listed = agg
        .call_tool(Some("s1"), "list_tools", json!({}))
        .await
        .unwrap();
    assert!(listed["tools"].as_array().unwrap().len() >= 5);

    let filtered = agg
        .call_tool(Some("s1"), "filter_tools", json!({"pattern": "pods"}))
        .await
        .unwrap();
    assert_eq!(filtered["tools"].as_array().unwrap().len(), 1);

    let described = agg
        .call_tool(Some("s1"), "describe_tool", json!({"name": "k8s_get_pods"}))
        .await
        .unwrap();
    assert_eq!(described["name"], "k8s_get_pods");

    let called = agg
        .call_tool(
            Some("s1"),
            "call_tool",
            json!({"name": "k8s_get_pods", "args": {"namespace": "kube-system"}}),
        )
        .await
        .unwrap();
    assert_eq!(called["tool"], "get_pods");
    assert_eq!(called["args"]["namespace"], "kube-system");

    // Meta recursion is rejected.
    assert!(
        agg.call_tool(Some("s1"), "call_tool", json!({"name": "call_tool"}))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_catalog_snapshot_reused_until_invalidated() {
    let (agg, _) = aggregator();
    register(
        &agg,
        definition("k8s", None, None),
        FakeClient::with_tools(&["get_pods"]),
    )
    .await;

    let first = agg.session_catalog(Some("s1")).await;
    let second = agg.session_catalog(Some("s1")).await;
    assert!(Arc::ptr_eq(&first, &second), "snapshot must be reused");

    agg.deregister_server("k8s").await;
    let third = agg.session_catalog(Some("s1")).await;
    assert!(!Arc::ptr_eq(&first, &third), "invalidated after change");
}
