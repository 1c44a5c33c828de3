//! Error types for Muster
//!
//! This module provides the error hierarchy using thiserror. All errors can
//! be converted to MusterError for unified handling; `status_message` maps an
//! error onto the one-line hint surfaced to users.

use thiserror::Error;

/// Main error type for Muster operations
#[derive(Error, Debug)]
pub enum MusterError {
    #[error("{entity} not found: {name}")]
    NotFound { entity: String, name: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authentication required for '{server}'")]
    AuthRequired {
        server: String,
        /// Authorization URL the caller should open, when a challenge exists.
        auth_url: Option<String>,
    },

    #[error("Template rendering failed: {0}")]
    Template(#[from] TemplateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("Dependency not satisfied: {0}")]
    DependencyUnsatisfied(String),

    #[error("Step execution failed: {step_id}: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Template-specific errors
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template syntax error: {0}")]
    Syntax(String),

    #[error("Template render error: {0}")]
    Render(#[from] minijinja::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("UUID parse error: {0}")]
    UuidParse(#[from] uuid::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err)
    }
}

impl From<sqlx::Error> for MusterError {
    fn from(err: sqlx::Error) -> Self {
        MusterError::Storage(StorageError::from(err))
    }
}

impl From<uuid::Error> for MusterError {
    fn from(err: uuid::Error) -> Self {
        MusterError::Storage(StorageError::UuidParse(err))
    }
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    /// 401 from a backing server; carries the challenge header so the auth
    /// pipeline can learn the issuer
    #[error("Unauthorized")]
    Unauthorized { www_authenticate: Option<String> },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

/// Convenient result type for Muster operations
pub type Result<T> = std::result::Result<T, MusterError>;

impl MusterError {
    /// Create a not found error
    #[inline]
    pub fn not_found(entity: impl Into<String>, name: impl Into<String>) -> Self {
        MusterError::NotFound {
            entity: entity.into(),
            name: name.into(),
        }
    }

    /// Create a validation error
    #[inline]
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        MusterError::Validation(msg.into())
    }

    /// Create a config error
    #[inline]
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MusterError::Config(msg.into())
    }

    /// Create an auth error
    #[inline]
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        MusterError::OAuth(msg.into())
    }

    /// Create an MCP protocol error
    #[inline]
    pub fn mcp<S: Into<String>>(msg: S) -> Self {
        MusterError::Mcp(msg.into())
    }

    /// Create a storage error with a message
    #[inline]
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        MusterError::Storage(StorageError::Connection(msg.into()))
    }

    /// Create a network error with a message
    #[inline]
    pub fn network<S: Into<String>>(msg: S) -> Self {
        MusterError::Network(NetworkError::Http(msg.into()))
    }

    /// Create a step execution error
    #[inline]
    pub fn step_execution<S: Into<String>>(step_id: S, message: S) -> Self {
        MusterError::StepExecution {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    /// Create an internal error for unexpected conditions
    #[inline]
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        MusterError::Internal(msg.into())
    }

    /// True when the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MusterError::Network(NetworkError::Http(_))
                | MusterError::Network(NetworkError::Timeout)
                | MusterError::Network(NetworkError::Reqwest(_))
                | MusterError::Io(_)
        )
    }

    /// Human-readable one-liner surfaced alongside failures.
    pub fn status_message(&self) -> String {
        match self {
            MusterError::AuthRequired { server, .. } => format!(
                "Authentication required — run: muster auth login --server {}",
                server
            ),
            MusterError::Network(NetworkError::Tls(_)) => {
                "Certificate error — verify TLS configuration".to_string()
            }
            MusterError::Network(_) => {
                "Cannot reach server — check network connectivity".to_string()
            }
            MusterError::NotFound { entity, name } => {
                format!("{} '{}' does not exist", entity, name)
            }
            MusterError::Validation(msg) => format!("Invalid input: {}", msg),
            MusterError::DependencyUnsatisfied(dep) => {
                format!("Waiting for dependency '{}' to become healthy", dep)
            }
            other => other.to_string(),
        }
    }

    /// Add context to an error
    pub fn context<C: std::fmt::Display>(self, context: C) -> Self {
        match self {
            Self::Validation(msg) => Self::Validation(format!("{}: {}", context, msg)),
            Self::Config(msg) => Self::Config(format!("{}: {}", context, msg)),
            Self::OAuth(msg) => Self::OAuth(format!("{}: {}", context, msg)),
            Self::Mcp(msg) => Self::Mcp(format!("{}: {}", context, msg)),
            Self::Internal(msg) => Self::Internal(format!("{}: {}", context, msg)),
            // For errors with source, preserve the source and add context at the top level
            other => Self::Internal(format!("{}: {}", context, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message_auth_required() {
        let err = MusterError::AuthRequired {
            server: "prometheus".to_string(),
            auth_url: None,
        };
        assert!(err.status_message().contains("muster auth login"));
        assert!(err.status_message().contains("prometheus"));
    }

    #[test]
    fn test_status_message_tls() {
        let err = MusterError::Network(NetworkError::Tls("bad cert".into()));
        assert!(err.status_message().contains("TLS"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(MusterError::Network(NetworkError::Timeout).is_transient());
        assert!(!MusterError::validation("nope").is_transient());
        assert!(
            !MusterError::AuthRequired {
                server: "x".into(),
                auth_url: None
            }
            .is_transient()
        );
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = MusterError::validation("missing field").context("workflow debug-pods");
        match err {
            MusterError::Validation(msg) => assert!(msg.starts_with("workflow debug-pods")),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
