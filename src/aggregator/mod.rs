//! Aggregator
//!
//! Multiplexes the tool, resource, and prompt catalogs of every healthy
//! backing server into a single logical MCP endpoint with per-session
//! visibility. The supervisor registers and deregisters servers as they move
//! through their lifecycle; sessions see copy-on-write catalog snapshots.

pub mod catalog;
pub mod meta;

use crate::auth::EgressAuthenticator;
use crate::client::{McpClient, RequestContext};
use crate::error::NetworkError;
use crate::event::{EventBus, EventPayload, ToolUpdateEvent, ToolUpdateKind};
use crate::model::{
    EgressMode, McpServerDefinition, PromptDescriptor, ResourceDescriptor, ToolDescriptor,
};
use crate::{MusterError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use catalog::{Catalog, CatalogBuilder, prefixed_name, strip_prefix};

/// Session-less tool dispatch used by the supervisor and workflow engine.
///
/// Fetched through the handler registry at call time so neither side holds a
/// direct reference to the other.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch_tool(
        &self,
        session: Option<&str>,
        tool: &str,
        args: Value,
    ) -> Result<Value>;

    async fn dispatch_list_tools(&self, session: Option<&str>) -> Result<Vec<ToolDescriptor>>;
}

/// Control-plane tool families (core operations, workflow tools) plug into
/// the aggregator through this trait.
#[async_trait]
pub trait BuiltinToolProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn tools(&self) -> Vec<ToolDescriptor>;
    fn owns(&self, tool: &str) -> bool;
    async fn call(&self, session: Option<&str>, tool: &str, args: Value) -> Result<Value>;
}

/// One healthy backing server as the aggregator sees it
pub struct RegisteredServer {
    pub definition: McpServerDefinition,
    pub client: Arc<dyn McpClient>,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
}

impl RegisteredServer {
    fn prefix(&self) -> Option<&str> {
        self.definition.tool_prefix.as_deref()
    }

    fn visible_tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|tool| prefixed_name(self.prefix(), &tool.name))
            .collect()
    }
}

struct SessionState {
    catalog: RwLock<Arc<Catalog>>,
}

/// The per-session multiplexer
pub struct Aggregator {
    servers: RwLock<HashMap<String, Arc<RegisteredServer>>>,
    sessions: DashMap<String, Arc<SessionState>>,
    providers: RwLock<Vec<Arc<dyn BuiltinToolProvider>>>,
    egress: Arc<EgressAuthenticator>,
    bus: Arc<EventBus>,
    generation: AtomicU64,
}

impl Aggregator {
    pub fn new(egress: Arc<EgressAuthenticator>, bus: Arc<EventBus>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            sessions: DashMap::new(),
            providers: RwLock::new(Vec::new()),
            egress,
            bus,
            generation: AtomicU64::new(1),
        }
    }

    /// Plug in a control-plane tool family
    pub fn add_provider(&self, provider: Arc<dyn BuiltinToolProvider>) {
        self.providers.write().push(provider);
        self.invalidate_catalogs();
    }

    // -----------------------------------------------------------------------
    // Server lifecycle (driven by the supervisor)
    // -----------------------------------------------------------------------

    /// Register a healthy backing server with its discovered catalog.
    /// Rejects tool-name collisions across servers.
    pub async fn register_server(
        &self,
        definition: McpServerDefinition,
        client: Arc<dyn McpClient>,
        tools: Vec<ToolDescriptor>,
        resources: Vec<ResourceDescriptor>,
        prompts: Vec<PromptDescriptor>,
    ) -> Result<()> {
        let registered = Arc::new(RegisteredServer {
            definition,
            client,
            tools,
            resources,
            prompts,
        });
        let name = registered.definition.name.clone();

        {
            let mut servers = self.servers.write();
            // Trial-build the unscoped catalog to detect collisions before
            // the new server becomes visible.
            let mut builder = CatalogBuilder::new(0);
            for server in servers.values() {
                builder.add_server(
                    &server.definition.name,
                    server.prefix(),
                    &server.tools,
                    &server.resources,
                    &server.prompts,
                )?;
            }
            builder.add_server(
                &name,
                registered.prefix(),
                &registered.tools,
                &registered.resources,
                &registered.prompts,
            )?;

            servers.insert(name.clone(), registered.clone());
        }

        self.invalidate_catalogs();
        self.bus
            .publish(EventPayload::ToolUpdate(ToolUpdateEvent {
                server: name,
                kind: ToolUpdateKind::ServerRegistered,
                tools: registered.visible_tool_names(),
            }))
            .await;
        Ok(())
    }

    /// Remove a server that left its healthy state
    pub async fn deregister_server(&self, name: &str) {
        let removed = self.servers.write().remove(name);
        if let Some(server) = removed {
            self.invalidate_catalogs();
            self.bus
                .publish(EventPayload::ToolUpdate(ToolUpdateEvent {
                    server: name.to_string(),
                    kind: ToolUpdateKind::ServerDeregistered,
                    tools: server.visible_tool_names(),
                }))
                .await;
        }
    }

    /// Replace a live server's tool list (live tool-change notification)
    pub async fn update_server_tools(&self, name: &str, tools: Vec<ToolDescriptor>) -> Result<()> {
        let updated = {
            let mut servers = self.servers.write();
            let Some(server) = servers.get(name) else {
                return Err(MusterError::not_found("MCPServer", name));
            };
            let updated = Arc::new(RegisteredServer {
                definition: server.definition.clone(),
                client: server.client.clone(),
                tools,
                resources: server.resources.clone(),
                prompts: server.prompts.clone(),
            });
            servers.insert(name.to_string(), updated.clone());
            updated
        };

        self.invalidate_catalogs();
        self.bus
            .publish(EventPayload::ToolUpdate(ToolUpdateEvent {
                server: name.to_string(),
                kind: ToolUpdateKind::ToolsUpdated,
                tools: updated.visible_tool_names(),
            }))
            .await;
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.servers.read().contains_key(name)
    }

    /// Force per-session catalogs to rebuild on next read (server set or
    /// builtin tool surface changed)
    pub fn invalidate_catalogs(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Sessions and catalogs
    // -----------------------------------------------------------------------

    /// Create the session lazily on first sight. The first request of a new
    /// session proactively warms forward-token servers.
    pub fn ensure_session(self: &Arc<Self>, session: &str) {
        if self.sessions.contains_key(session) {
            return;
        }
        let created = self
            .sessions
            .insert(
                session.to_string(),
                Arc::new(SessionState {
                    catalog: RwLock::new(Arc::new(Catalog::default())),
                }),
            )
            .is_none();

        if created {
            tracing::debug!("session '{}' created", session);
            let aggregator = self.clone();
            let session = session.to_string();
            tokio::spawn(async move {
                aggregator.warm_forward_token_servers(&session).await;
            });
        }
    }

    /// Proactive SSO: resolve bearers for every forward-token server so the
    /// session's first listing already sees them.
    async fn warm_forward_token_servers(&self, session: &str) {
        let forwarding: Vec<Arc<RegisteredServer>> = {
            let servers = self.servers.read();
            servers
                .values()
                .filter(|server| {
                    server
                        .definition
                        .auth
                        .as_ref()
                        .is_some_and(|policy| policy.egress_mode() == EgressMode::ForwardToken)
                })
                .cloned()
                .collect()
        };

        for server in forwarding {
            if let Err(e) = self
                .egress
                .resolve_bearer(session, &server.definition)
                .await
            {
                tracing::debug!(
                    "proactive SSO for '{}' on session '{}' skipped: {}",
                    server.definition.name,
                    session,
                    e
                );
            }
        }
    }

    /// Current catalog snapshot for a session; rebuilt when the server set
    /// changed since the last snapshot.
    pub async fn session_catalog(self: &Arc<Self>, session: Option<&str>) -> Arc<Catalog> {
        let generation = self.generation.load(Ordering::Acquire);

        match session {
            Some(session) => {
                self.ensure_session(session);
                let state = self
                    .sessions
                    .get(session)
                    .map(|entry| entry.value().clone())
                    .expect("session just ensured");

                {
                    let current = state.catalog.read();
                    if current.generation == generation {
                        return current.clone();
                    }
                }

                let rebuilt = Arc::new(self.build_catalog(Some(session), generation).await);
                *state.catalog.write() = rebuilt.clone();
                rebuilt
            }
            // Internal path: unscoped, rebuilt on demand.
            None => Arc::new(self.build_catalog(None, generation).await),
        }
    }

    async fn build_catalog(&self, session: Option<&str>, generation: u64) -> Catalog {
        let mut builder = CatalogBuilder::new(generation);

        builder.add_builtin_tools(meta::meta_tool_descriptors());
        for provider in self.providers.read().iter() {
            builder.add_builtin_tools(provider.tools());
        }

        let servers: Vec<Arc<RegisteredServer>> =
            self.servers.read().values().cloned().collect();
        for server in servers {
            if let Some(session) = session
                && !self.visible_to(session, &server.definition).await
            {
                continue;
            }
            // Collisions were rejected at registration; a failure here means
            // a builtin clashed, which add_builtin_tools already resolved.
            if let Err(e) = builder.add_server(
                &server.definition.name,
                server.prefix(),
                &server.tools,
                &server.resources,
                &server.prompts,
            ) {
                tracing::error!(
                    "catalog assembly skipped server '{}': {}",
                    server.definition.name,
                    e
                );
            }
        }

        builder.build()
    }

    /// Visibility: the server's auth policy permits this session,
    /// considering forwardable tokens. Cache lookups only, no network.
    async fn visible_to(&self, session: &str, definition: &McpServerDefinition) -> bool {
        let Some(policy) = &definition.auth else {
            return true;
        };
        let store = self.egress.token_store();
        match policy.egress_mode() {
            EgressMode::NoAuth => true,
            EgressMode::ForwardToken | EgressMode::TokenExchange => {
                store.find_token_with_id_token(session).await.is_some()
            }
            EgressMode::SsoReuse => match policy.issuer_url {
                Some(ref issuer) => store.get_by_issuer(session, issuer).await.is_some(),
                None => false,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Route a tool call: meta-tools, then control-plane providers, then
    /// backing servers by (prefix-stripped) name.
    pub async fn call_tool(
        self: &Arc<Self>,
        session: Option<&str>,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        if meta::is_meta_tool(name) {
            return meta::call_meta_tool(self, session, name, args).await;
        }

        let provider = {
            let providers = self.providers.read();
            providers.iter().find(|p| p.owns(name)).cloned()
        };
        if let Some(provider) = provider {
            return provider.call(session, name, args).await;
        }

        self.call_server_tool(session, name, args).await
    }

    async fn call_server_tool(
        self: &Arc<Self>,
        session: Option<&str>,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        // Owner resolution uses the unscoped server set: a tool on a server
        // the session cannot see yet must produce an auth challenge, not
        // tool-not-found.
        let server = self.owner_of_tool(name);
        let Some((server, raw_name)) = server else {
            return Err(MusterError::not_found("tool", name));
        };

        let egress_session = session.unwrap_or(crate::constants::ANONYMOUS_SESSION);
        let bearer = self
            .egress
            .resolve_bearer(egress_session, &server.definition)
            .await?;

        let ctx = RequestContext::new().with_bearer(bearer);
        match server.client.call_tool(&ctx, &raw_name, args).await {
            Ok(result) => Ok(result),
            Err(MusterError::Network(NetworkError::Unauthorized { www_authenticate })) => {
                Err(self.handle_unauthorized(session, &server, www_authenticate.as_deref()))
            }
            Err(other) => Err(other),
        }
    }

    /// Find the registered server owning an externally visible tool name.
    /// Returns the server and the prefix-stripped name.
    fn owner_of_tool(&self, name: &str) -> Option<(Arc<RegisteredServer>, String)> {
        let servers = self.servers.read();
        for server in servers.values() {
            if let Some(raw) = strip_prefix(server.prefix(), name)
                && server.tools.iter().any(|tool| tool.name == raw)
            {
                return Some((server.clone(), raw.to_string()));
            }
        }
        None
    }

    /// 401 from a backing server: revoke any cached token for its issuer and
    /// hand the session a challenge whose completion re-establishes the
    /// connection transparently.
    fn handle_unauthorized(
        self: &Arc<Self>,
        session: Option<&str>,
        server: &Arc<RegisteredServer>,
        www_authenticate: Option<&str>,
    ) -> MusterError {
        let definition = &server.definition;
        if let Some(policy) = &definition.auth
            && let Some(ref issuer) = policy.issuer_url
            && let Some(session) = session
        {
            self.egress.token_store().clear_by_issuer(session, issuer);
        }

        let Some(session) = session else {
            return MusterError::AuthRequired {
                server: definition.name.clone(),
                auth_url: None,
            };
        };

        let aggregator = Arc::downgrade(self);
        let server_name = definition.name.clone();
        let client = server.client.clone();
        let on_complete: crate::auth::CompletionCallback = Arc::new(move |record| {
            let Some(aggregator) = aggregator.upgrade() else {
                return;
            };
            aggregator.invalidate_catalogs();
            let client = client.clone();
            let server_name = server_name.clone();
            let bearer = record.access_token.clone();
            tokio::spawn(async move {
                // Re-establish the session-server connection with the fresh
                // token so the next listing is served warm.
                let ctx = RequestContext::new().with_bearer(Some(bearer));
                if let Err(e) = client.list_tools(&ctx).await {
                    tracing::debug!(
                        "post-auth revalidation of '{}' failed: {}",
                        server_name,
                        e
                    );
                }
            });
        });

        self.egress
            .challenge_from_401(session, definition, www_authenticate, Some(on_complete))
    }

    // -----------------------------------------------------------------------
    // Listings and reads
    // -----------------------------------------------------------------------

    pub async fn list_tools(self: &Arc<Self>, session: Option<&str>) -> Vec<ToolDescriptor> {
        self.session_catalog(session).await.tools.clone()
    }

    pub async fn list_resources(
        self: &Arc<Self>,
        session: Option<&str>,
    ) -> Vec<ResourceDescriptor> {
        self.session_catalog(session).await.resources.clone()
    }

    pub async fn list_prompts(self: &Arc<Self>, session: Option<&str>) -> Vec<PromptDescriptor> {
        self.session_catalog(session).await.prompts.clone()
    }

    pub async fn read_resource(
        self: &Arc<Self>,
        session: Option<&str>,
        uri: &str,
    ) -> Result<Value> {
        let server = {
            let servers = self.servers.read();
            servers
                .values()
                .find(|server| server.resources.iter().any(|r| r.uri == uri))
                .cloned()
        };
        let Some(server) = server else {
            return Err(MusterError::not_found("resource", uri));
        };

        let egress_session = session.unwrap_or(crate::constants::ANONYMOUS_SESSION);
        let bearer = self
            .egress
            .resolve_bearer(egress_session, &server.definition)
            .await?;
        let ctx = RequestContext::new().with_bearer(bearer);
        match server.client.read_resource(&ctx, uri).await {
            Err(MusterError::Network(NetworkError::Unauthorized { www_authenticate })) => {
                Err(self.handle_unauthorized(session, &server, www_authenticate.as_deref()))
            }
            other => other,
        }
    }

    pub async fn get_prompt(
        self: &Arc<Self>,
        session: Option<&str>,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        let found = {
            let servers = self.servers.read();
            servers.values().find_map(|server| {
                strip_prefix(server.prefix(), name)
                    .filter(|raw| server.prompts.iter().any(|p| p.name == *raw))
                    .map(|raw| (server.clone(), raw.to_string()))
            })
        };
        let Some((server, raw_name)) = found else {
            return Err(MusterError::not_found("prompt", name));
        };

        let egress_session = session.unwrap_or(crate::constants::ANONYMOUS_SESSION);
        let bearer = self
            .egress
            .resolve_bearer(egress_session, &server.definition)
            .await?;
        let ctx = RequestContext::new().with_bearer(bearer);
        match server.client.get_prompt(&ctx, &raw_name, args).await {
            Err(MusterError::Network(NetworkError::Unauthorized { www_authenticate })) => {
                Err(self.handle_unauthorized(session, &server, www_authenticate.as_deref()))
            }
            other => other,
        }
    }

}

/// ToolDispatcher over an Arc'd aggregator, registered in the handler
/// registry for the supervisor and workflow engine.
pub struct ArcDispatcher(pub Arc<Aggregator>);

#[async_trait]
impl ToolDispatcher for ArcDispatcher {
    async fn dispatch_tool(
        &self,
        session: Option<&str>,
        tool: &str,
        args: Value,
    ) -> Result<Value> {
        self.0.call_tool(session, tool, args).await
    }

    async fn dispatch_list_tools(&self, session: Option<&str>) -> Result<Vec<ToolDescriptor>> {
        Ok(self.0.list_tools(session).await)
    }
}

#[cfg(test)]
mod aggregator_test;
