//! Configuration for Muster
//!
//! Process configuration loaded from a YAML file plus the in-memory store of
//! declarative resource definitions (MCPServer, ServiceClass, Workflow)
//! loaded from the definition directory and kept in sync by the reconciler.

pub mod definitions;

use crate::{MusterError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use definitions::{DefinitionKind, DefinitionStore, LoadedDefinition};

/// Complete Muster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration for execution history
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// OAuth client configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,

    /// Directory holding the YAML resource definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definitions_dir: Option<String>,

    /// File-based Kubernetes-style event sink; None disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log: Option<String>,

    /// Retention cap for workflow execution history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            http: HttpConfig::default(),
            oauth: None,
            definitions_dir: None,
            event_log: None,
            history_limit: default_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    crate::constants::DEFAULT_HISTORY_LIMIT
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Driver name (memory, sqlite)
    pub driver: String,

    /// Database path for sqlite
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            dsn: String::new(),
        }
    }
}

/// HTTP ingress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path completing browser OAuth flows
    #[serde(default = "default_callback_path")]
    pub oauth_callback_path: String,

    /// Path serving the OAuth client metadata document
    #[serde(default = "default_cimd_path")]
    pub cimd_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            oauth_callback_path: default_callback_path(),
            cimd_path: default_cimd_path(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_callback_path() -> String {
    crate::constants::DEFAULT_OAUTH_CALLBACK_PATH.to_string()
}
fn default_cimd_path() -> String {
    crate::constants::DEFAULT_CIMD_PATH.to_string()
}

/// OAuth client registration for muster itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,

    /// Environment variable holding the client secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_env: Option<String>,

    /// Muster's own issuer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_url: Option<String>,

    /// Externally reachable base URL used to build the redirect URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MusterError::config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| MusterError::config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.storage.driver.as_str() {
            "memory" => Ok(()),
            "sqlite" if !self.storage.dsn.is_empty() => Ok(()),
            "sqlite" => Err(MusterError::config("sqlite storage requires a dsn")),
            other => Err(MusterError::config(format!(
                "unknown storage driver '{}'",
                other
            ))),
        }
    }

    /// Redirect URI muster registers for browser callbacks
    pub fn oauth_redirect_uri(&self) -> String {
        let base = self
            .oauth
            .as_ref()
            .and_then(|oauth| oauth.external_url.clone())
            .unwrap_or_else(|| format!("http://{}:{}", self.http.host, self.http.port));
        format!(
            "{}{}",
            base.trim_end_matches('/'),
            self.http.oauth_callback_path
        )
    }

    /// OAuth client config for the auth subsystem; a placeholder client is
    /// used when nothing is configured (challenges then fail upstream, not
    /// here).
    pub fn oauth_client_config(&self) -> crate::auth::OAuthClientConfig {
        let client_id = self
            .oauth
            .as_ref()
            .map(|oauth| oauth.client_id.clone())
            .unwrap_or_else(|| "muster".to_string());
        let client_secret = self
            .oauth
            .as_ref()
            .and_then(|oauth| oauth.client_secret_env.as_ref())
            .and_then(|name| std::env::var(name).ok());
        crate::auth::OAuthClientConfig {
            client_id,
            client_secret,
            redirect_uri: self.oauth_redirect_uri(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.driver, "memory");
        assert_eq!(config.http.port, 8090);
        assert_eq!(
            config.http.oauth_callback_path,
            crate::constants::DEFAULT_OAUTH_CALLBACK_PATH
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
storage:
  driver: sqlite
  dsn: .muster/muster.db
http:
  port: 9000
oauth:
  client_id: muster-dev
  issuer_url: https://dex.local
definitions_dir: ./definitions
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.driver, "sqlite");
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.oauth.as_ref().unwrap().client_id, "muster-dev");
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_storage_driver_rejected() {
        let config = Config {
            storage: StorageConfig {
                driver: "postgres".to_string(),
                dsn: "x".to_string(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redirect_uri_from_external_url() {
        let mut config = Config::default();
        config.oauth = Some(OAuthConfig {
            client_id: "muster".to_string(),
            client_secret_env: None,
            issuer_url: None,
            external_url: Some("https://muster.example/".to_string()),
        });
        assert_eq!(
            config.oauth_redirect_uri(),
            "https://muster.example/oauth/proxy/callback"
        );
    }
}
