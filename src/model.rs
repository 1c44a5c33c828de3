//! Core data models for Muster
//!
//! Declarative definitions (MCPServer, ServiceClass, Workflow), the runtime
//! records derived from them, and the auth policy types shared by the egress
//! pipeline. All definitions deserialize from the YAML resource files the
//! reconciler watches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// MCPServer definitions
// ---------------------------------------------------------------------------

/// Declarative configuration of one backing MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerDefinition {
    /// Unique server name (REQUIRED)
    pub name: String,

    /// Human-readable description (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Transport variant and its payload (REQUIRED)
    pub transport: Transport,

    /// Prefix applied to every tool this server exposes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_prefix: Option<String>,

    /// Start the server as soon as its dependencies are satisfied
    #[serde(default)]
    pub auto_start: bool,

    /// Egress authentication policy; absent means unauthenticated calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthPolicy>,

    /// Health probing overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckConfig>,

    /// Names of services that must be healthy before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Backing-server transport variant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Transport {
    /// Child process speaking MCP over stdio
    LocalStdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote endpoint speaking MCP over HTTP POST
    RemoteHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Remote endpoint streaming responses over SSE
    RemoteSse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl Transport {
    pub fn is_local(&self) -> bool {
        matches!(self, Transport::LocalStdio { .. })
    }
}

impl McpServerDefinition {
    /// Validate the definition before it is accepted
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::MusterError::validation("server name is required"));
        }
        if !is_identifier(&self.name) {
            return Err(crate::MusterError::validation(format!(
                "server name '{}' must be an identifier fragment",
                self.name
            )));
        }
        if let Some(ref prefix) = self.tool_prefix
            && !is_identifier(prefix)
        {
            return Err(crate::MusterError::validation(format!(
                "tool_prefix '{}' must be an identifier fragment",
                prefix
            )));
        }
        match &self.transport {
            Transport::LocalStdio { command, .. } if command.is_empty() => {
                Err(crate::MusterError::validation("command is required"))
            }
            Transport::RemoteHttp { url, .. } | Transport::RemoteSse { url, .. } => {
                url::Url::parse(url)
                    .map(|_| ())
                    .map_err(|e| crate::MusterError::validation(format!("invalid url: {}", e)))
            }
            _ => Ok(()),
        }
    }
}

/// Letters, digits, underscores, dashes; must not be empty
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Authentication policy
// ---------------------------------------------------------------------------

/// Per-server egress authentication policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthPolicy {
    /// Reuse any session token issued by the same issuer (default true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sso: Option<bool>,

    /// Forward the session's muster-issued ID token
    #[serde(default)]
    pub forward_token: bool,

    /// Audiences merged into the initial authorization request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_audiences: Vec<String>,

    /// RFC 8693 token exchange against a remote token endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_exchange: Option<TokenExchangeConfig>,

    /// Issuer this server's tokens come from, for SSO reuse and cache keying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_url: Option<String>,

    /// Whether refresh failure should fall back to a fresh OAuth flow
    #[serde(default)]
    pub fallback_to_own_auth: bool,

    /// Scope requested when a challenge flow is initiated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// RFC 8693 token exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenExchangeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Remote token endpoint, e.g. `https://dex.b.example/token`
    pub token_endpoint: String,

    /// Connector id passed through to the remote IdP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,

    /// Optional client credentials for the exchange request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Name of the secret holding the client secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Resolved egress mode, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressMode {
    NoAuth,
    TokenExchange,
    ForwardToken,
    SsoReuse,
}

impl AuthPolicy {
    /// Resolve the configured flags into a single mode.
    ///
    /// Exchange dominates forwarding, forwarding dominates reuse, and
    /// forward_token wins even when sso=false is set alongside it.
    pub fn egress_mode(&self) -> EgressMode {
        if self
            .token_exchange
            .as_ref()
            .is_some_and(|x| x.enabled)
        {
            EgressMode::TokenExchange
        } else if self.forward_token {
            EgressMode::ForwardToken
        } else if self.sso != Some(false) {
            EgressMode::SsoReuse
        } else {
            EgressMode::NoAuth
        }
    }
}

// ---------------------------------------------------------------------------
// Service runtime state
// ---------------------------------------------------------------------------

/// Lifecycle states of a supervised service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    /// Local process is up and healthy
    Running,
    /// Remote endpoint is reachable and healthy
    Connected,
    Stopping,
    Failed,
    /// A declared dependency is not healthy
    Waiting,
    /// Backing off before the next reconnect attempt
    Retrying,
}

impl ServiceState {
    /// Whether the state machine permits moving from `self` to `to`
    pub fn can_transition_to(self, to: ServiceState) -> bool {
        use ServiceState::*;
        if self == to {
            return false;
        }
        // Stopping is reachable from anywhere (manual stop or cascade).
        if to == Stopping {
            return true;
        }
        match (self, to) {
            (Stopped, Starting) | (Stopped, Waiting) => true,
            (Starting, Running) | (Starting, Connected) | (Starting, Failed) => true,
            (Starting, Waiting) => true,
            (Running, Retrying) | (Connected, Retrying) => true,
            (Retrying, Running) | (Retrying, Connected) => true,
            (Retrying, Failed) | (Retrying, Stopped) => true,
            (Stopping, Stopped) => true,
            (Waiting, Starting) | (Waiting, Stopped) => true,
            (Failed, Starting) | (Failed, Stopped) | (Failed, Waiting) => true,
            _ => false,
        }
    }

    /// Running for local services, Connected for remote ones
    pub fn is_healthy(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Connected)
    }
}

/// Health probe outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    /// A 401 from the backing server; not a health failure
    AuthRequired,
}

/// Why a service left (or is leaving) its healthy state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Explicit operator action; sticky across dependency recovery
    Manual,
    /// Stopped because a dependency went away; restarted when it returns
    Dependency,
    Failure,
    Shutdown,
}

/// Kind of supervised service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum ServiceType {
    McpServer,
    /// Instance created from a ServiceClass template
    Instance { class: String },
}

/// Snapshot of one service's runtime state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub state: ServiceState,
    pub health: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl ServiceStatus {
    pub fn new(name: &str, service_type: ServiceType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            service_type,
            state: ServiceState::Stopped,
            health: HealthState::Unknown,
            last_error: None,
            consecutive_failures: 0,
            last_attempt: None,
            next_retry_after: None,
            stop_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceClass definitions
// ---------------------------------------------------------------------------

/// Template whose lifecycle is expressed as tool calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceClassDefinition {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Typed argument schema applied to instance creation
    #[serde(default)]
    pub args: HashMap<String, ArgSpec>,

    pub lifecycle_tools: LifecycleTools,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,

    /// Names of other ServiceClasses instances of this class depend on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl ServiceClassDefinition {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::MusterError::validation(
                "service class name is required",
            ));
        }
        if self.lifecycle_tools.start.tool.is_empty() {
            return Err(crate::MusterError::validation(
                "lifecycle_tools.start.tool is required",
            ));
        }
        if self.lifecycle_tools.stop.tool.is_empty() {
            return Err(crate::MusterError::validation(
                "lifecycle_tools.stop.tool is required",
            ));
        }
        Ok(())
    }
}

/// The tool calls driving a ServiceClass instance's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTools {
    pub start: LifecycleTool,
    pub stop: LifecycleTool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<LifecycleTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<LifecycleTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LifecycleTool>,
}

/// One lifecycle tool call: tool name, static args, response extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleTool {
    pub tool: String,

    /// Static arguments, templated against the instance args
    #[serde(default)]
    pub args: HashMap<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mapping: Option<ResponseMapping>,
}

/// Dot-paths extracting fields from a lifecycle tool response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMapping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Exact-match expectations applied to the health tool response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect: Option<ExpectClause>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            expect: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_health_interval() -> u64 {
    crate::constants::DEFAULT_HEALTH_INTERVAL.as_secs()
}
fn default_failure_threshold() -> u32 {
    crate::constants::DEFAULT_FAILURE_THRESHOLD
}
fn default_success_threshold() -> u32 {
    crate::constants::DEFAULT_SUCCESS_THRESHOLD
}

/// Per-operation timeouts for ServiceClass lifecycles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_secs: Option<u64>,
}

/// A concrete service created from a ServiceClass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub class_name: String,
    /// Schema-validated creation arguments; immutable post-creation
    pub args: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Argument schemas
// ---------------------------------------------------------------------------

/// One named argument in a Workflow or ServiceClass schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    #[serde(rename = "type")]
    pub arg_type: ArgType,

    #[serde(default)]
    pub required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ArgType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ArgType::String => value.is_string(),
            ArgType::Number => value.is_number(),
            ArgType::Boolean => value.is_boolean(),
            ArgType::Object => value.is_object(),
            ArgType::Array => value.is_array(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Number => "number",
            ArgType::Boolean => "boolean",
            ArgType::Object => "object",
            ArgType::Array => "array",
        }
    }
}

/// Validate `input` against `schema`: type-check, apply defaults for missing
/// non-required args, reject unknown keys and missing required args.
pub fn validate_args(
    schema: &HashMap<String, ArgSpec>,
    input: &HashMap<String, Value>,
) -> crate::Result<HashMap<String, Value>> {
    for key in input.keys() {
        if !schema.contains_key(key) {
            return Err(crate::MusterError::validation(format!(
                "unknown argument '{}'",
                key
            )));
        }
    }

    let mut validated = HashMap::new();
    for (name, spec) in schema {
        match input.get(name) {
            Some(value) => {
                if !spec.arg_type.matches(value) {
                    return Err(crate::MusterError::validation(format!(
                        "argument '{}' must be a {}",
                        name,
                        spec.arg_type.as_str()
                    )));
                }
                validated.insert(name.clone(), value.clone());
            }
            None if spec.required => {
                return Err(crate::MusterError::validation(format!(
                    "missing required argument '{}'",
                    name
                )));
            }
            None => {
                if let Some(ref default) = spec.default {
                    validated.insert(name.clone(), default.clone());
                }
            }
        }
    }

    Ok(validated)
}

// ---------------------------------------------------------------------------
// Workflow definitions
// ---------------------------------------------------------------------------

/// Ordered, templated, conditionally gated sequence of tool calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub args: HashMap<String, ArgSpec>,

    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Step ids must be unique; tool references bind late (at execution).
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::MusterError::validation("workflow name is required"));
        }
        if !is_identifier(&self.name) {
            return Err(crate::MusterError::validation(format!(
                "workflow name '{}' must be an identifier fragment",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(crate::MusterError::validation("step id is required"));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(crate::MusterError::validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }
        Ok(())
    }
}

/// A single workflow step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique step identifier (REQUIRED)
    pub id: String,

    /// Tool to execute (REQUIRED)
    pub tool: String,

    /// Tool arguments; string values may carry templates
    #[serde(default)]
    pub args: HashMap<String, Value>,

    /// Conditional gating; unmet conditions skip the step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,

    /// Dot-paths extracting named values from the result into the scope
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,

    /// Record the error and keep going instead of failing the execution
    #[serde(default)]
    pub allow_failure: bool,

    /// Store the whole result in the scope under the step id
    #[serde(default)]
    pub store: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Step gating: evaluate a prior result or a fresh tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    /// Evaluate against this step's stored result instead of calling a tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_step: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    #[serde(default)]
    pub args: HashMap<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect: Option<ExpectClause>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_not: Option<ExpectClause>,
}

/// Success flag plus exact-match dot-path expectations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectClause {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub json_path: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Workflow executions
// ---------------------------------------------------------------------------

/// Execution status of a workflow run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Inprogress,
    Completed,
    Failed,
}

/// Status of one executed step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// Durable record of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub input: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepExecution>,
}

/// Record of a single step inside an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepStatus,
    /// Arguments after template resolution
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Scope variable this step's result was stored under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_as: Option<String>,
    /// Template warnings (e.g. unresolved references)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tokens and auth status
// ---------------------------------------------------------------------------

/// One cached token, keyed by (session, issuer, scope)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub session_id: String,
    pub issuer_url: String,
    pub scope: String,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Expired or expiring within the refresh skew window
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        let skew = chrono::Duration::from_std(crate::constants::TOKEN_REFRESH_SKEW)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Utc::now() + skew >= self.expires_at
    }
}

/// Per-endpoint authentication status returned by status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    pub endpoint: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Catalog entries
// ---------------------------------------------------------------------------

/// One tool as seen through the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Prefixed, externally visible name
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Owning backing server, or "muster" for built-ins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

/// One resource as seen through the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

/// One prompt as seen through the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}
