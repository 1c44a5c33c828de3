//! Muster - MCP aggregation control plane
//!
//! Muster aggregates many heterogeneous MCP servers into a single logical
//! endpoint for AI agents. It supervises the lifecycle of each backing
//! server (local child processes and remote HTTP/SSE endpoints), multiplexes
//! their tool/resource/prompt catalogs with per-session visibility, enforces
//! OAuth on the egress side, and runs declarative orchestration on top:
//! Workflows (deterministic multi-step tool pipelines) and ServiceClasses
//! (templates whose lifecycle is itself expressed as tool calls).
//!
//! # Architecture
//!
//! Subsystems register named handlers in a process-wide registry and talk to
//! each other through it, never directly:
//! - the **supervisor** drives per-service state machines with health
//!   probing, exponential backoff, and dependency-aware cascades
//! - the **aggregator** multiplexes backing-server catalogs per session
//!   with tool prefixing and live tool-update events
//! - the **auth pipeline** caches tokens per (session, issuer, scope) and
//!   resolves egress credentials: token exchange, ID-token forwarding, SSO
//!   reuse, or a 401-driven browser challenge
//! - the **workflow engine** executes templated, conditionally gated step
//!   pipelines with durable execution history
//! - the **reconciler** syncs YAML definitions on disk to running services
//!
//! # Example
//!
//! ```rust,no_run
//! use muster::config::Config;
//! use muster::core::create_runtime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = create_runtime(Config::default()).await?;
//!     let tools = runtime.aggregator.list_tools(Some("my-session")).await;
//!     println!("{} tools available", tools.len());
//!     Ok(())
//! }
//! ```

// Core modules
pub mod constants;
pub mod error;
pub mod model;

// Capability wiring
pub mod registry;

// Subsystems
pub mod aggregator;
pub mod auth;
pub mod client;
pub mod graph;
pub mod supervisor;
pub mod workflow;

// Infrastructure
pub mod config;
pub mod event;
pub mod reconciler;
pub mod storage;

// Interface layers
pub mod cli;
pub mod core;
pub mod http;

// Utilities
pub mod utils;

// Re-exports for convenience
pub use error::{MusterError, Result};
pub use model::{
    McpServerDefinition, ServiceClassDefinition, ServiceState, ServiceStatus, StopReason,
    WorkflowDefinition, WorkflowExecution,
};

/// Initialize logging for the application
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "muster=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
