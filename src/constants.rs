//! Shared constants for Muster
//!
//! Central place for defaults, header names, tool-name prefixes, and timing
//! knobs so the rest of the crate never hard-codes strings twice.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// Session header honored on ingress; takes precedence over any
/// transport-generated session id.
pub const SESSION_HEADER: &str = "X-Muster-Session-ID";

/// Transport-level session header used as a fallback.
pub const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

/// Session id used when a request carries no session header at all.
pub const ANONYMOUS_SESSION: &str = "anonymous";

/// Default path completing browser OAuth flows.
pub const DEFAULT_OAUTH_CALLBACK_PATH: &str = "/oauth/proxy/callback";

/// Default path serving the client metadata document (CIMD).
pub const DEFAULT_CIMD_PATH: &str = "/.well-known/oauth-client.json";

// ---------------------------------------------------------------------------
// Tool naming
// ---------------------------------------------------------------------------

/// Prefix for management tools exposed by the control plane itself.
pub const CORE_TOOL_PREFIX: &str = "core_";

/// Prefix for auto-generated per-workflow tools.
pub const WORKFLOW_TOOL_PREFIX: &str = "workflow_";

/// Meta-tools the aggregator serves directly.
pub const META_TOOL_LIST: &str = "list_tools";
pub const META_TOOL_FILTER: &str = "filter_tools";
pub const META_TOOL_DESCRIBE: &str = "describe_tool";
pub const META_TOOL_CALL: &str = "call_tool";

// ---------------------------------------------------------------------------
// Handler registry names
// ---------------------------------------------------------------------------

pub const HANDLER_TOOL_DISPATCHER: &str = "tool_dispatcher";
pub const HANDLER_AGGREGATOR: &str = "aggregator";
pub const HANDLER_TOKEN_STORE: &str = "token_store";
pub const HANDLER_SUPERVISOR: &str = "supervisor";
pub const HANDLER_EVENT_BUS: &str = "event_bus";

// ---------------------------------------------------------------------------
// Supervisor timing
// ---------------------------------------------------------------------------

/// Default health probe interval.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive failed probes before a running service enters Retrying.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Consecutive successful probes before a retrying service recovers.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;

/// Base delay for exponential reconnect backoff.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap for exponential reconnect backoff.
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Retry attempts before a service is marked Failed.
pub const DEFAULT_RETRY_CAP: u32 = 10;

/// Grace delay between a cascade stop and the dependent restart, avoiding
/// address-in-use races for port-binding services.
pub const RESTART_GRACE: Duration = Duration::from_secs(1);

/// Grace period for a local child process to exit before it is killed.
pub const CHILD_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-request timeout for health probes.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for tool calls against backing servers.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Tokens expiring within this window are refreshed eagerly on access.
pub const TOKEN_REFRESH_SKEW: Duration = Duration::from_secs(60);

/// Pending OAuth challenges are discarded after this long without a callback.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(600);

/// RFC 8693 token-exchange grant type.
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// RFC 8693 subject token type for ID tokens.
pub const ID_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:id_token";

// ---------------------------------------------------------------------------
// Workflow engine
// ---------------------------------------------------------------------------

/// Maximum in-memory execution records retained.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Default page size for execution history queries.
pub const HISTORY_PAGE_SIZE: usize = 50;

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Default per-subscriber buffer capacity.
pub const EVENT_BUFFER_CAPACITY: usize = 256;

/// Bounded drain timeout applied to the event bus on shutdown.
pub const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Base backoff applied after a transient reconcile error.
pub const RECONCILE_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Cap for reconcile backoff.
pub const RECONCILE_BACKOFF_CAP: Duration = Duration::from_secs(120);

/// Retries before a transient reconcile error marks the item Failed.
pub const RECONCILE_RETRY_CAP: u32 = 5;

// ---------------------------------------------------------------------------
// JSON-RPC / MCP
// ---------------------------------------------------------------------------

/// MCP protocol version spoken on both ingress and egress.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error code for a missing method.
pub const JSONRPC_METHOD_NOT_FOUND: i32 = -32601;

/// JSON-RPC error code for invalid params.
pub const JSONRPC_INVALID_PARAMS: i32 = -32602;

/// JSON-RPC error code for internal errors.
pub const JSONRPC_INTERNAL_ERROR: i32 = -32603;
