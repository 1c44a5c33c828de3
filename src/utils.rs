//! Utility helpers
//!
//! The isolated test environment used by integration tests.

use crate::config::Config;
use crate::core::{Runtime, create_runtime};
use tempfile::TempDir;

/// Test environment with isolated temporary directories
///
/// Provides a complete runtime wired like production, but with in-memory
/// history storage and a temporary definitions directory that is cleaned up
/// on drop.
pub struct TestEnvironment {
    /// Temporary directory - kept alive for test duration
    _temp_dir: TempDir,

    /// Assembled control plane, ready to use
    pub runtime: Runtime,

    /// The definitions directory inside the temp dir
    pub definitions_dir: std::path::PathBuf,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let definitions_dir = temp_dir.path().join("definitions");
        std::fs::create_dir_all(&definitions_dir).expect("failed to create definitions dir");

        let config = Config {
            definitions_dir: Some(definitions_dir.to_string_lossy().to_string()),
            event_log: Some(
                temp_dir
                    .path()
                    .join("events.jsonl")
                    .to_string_lossy()
                    .to_string(),
            ),
            ..Default::default()
        };

        let runtime = create_runtime(config)
            .await
            .expect("failed to build test runtime");

        TestEnvironment {
            _temp_dir: temp_dir,
            runtime,
            definitions_dir,
        }
    }

    /// Write a definition file into the watched directory
    pub fn write_definition(&self, file: &str, content: &str) -> std::path::PathBuf {
        let path = self.definitions_dir.join(file);
        std::fs::write(&path, content).expect("failed to write definition");
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_environment_builds_runtime() {
        let env = TestEnvironment::new().await;

        // Meta-tools are present without any backing server.
        let tools = env.runtime.aggregator.list_tools(Some("test")).await;
        assert!(tools.iter().any(|t| t.name == "list_tools"));
        assert!(tools.iter().any(|t| t.name == "core_service_list"));
    }
}
