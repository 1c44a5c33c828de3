//! Resource definition store
//!
//! Holds the current declarative state: MCPServer, ServiceClass, and
//! Workflow definitions. In filesystem mode definitions live as YAML files
//! (one document per resource, `kind` discriminated) under a configured
//! directory; the reconciler keeps the running services in sync with this
//! store.

use crate::model::{McpServerDefinition, ServiceClassDefinition, WorkflowDefinition};
use crate::{MusterError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The three declarative resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefinitionKind {
    #[serde(rename = "MCPServer")]
    McpServer,
    ServiceClass,
    Workflow,
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefinitionKind::McpServer => write!(f, "MCPServer"),
            DefinitionKind::ServiceClass => write!(f, "ServiceClass"),
            DefinitionKind::Workflow => write!(f, "Workflow"),
        }
    }
}

/// One YAML document as found on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LoadedDefinition {
    #[serde(rename = "MCPServer")]
    McpServer(McpServerDefinition),
    ServiceClass(ServiceClassDefinition),
    Workflow(WorkflowDefinition),
}

impl LoadedDefinition {
    pub fn kind(&self) -> DefinitionKind {
        match self {
            LoadedDefinition::McpServer(_) => DefinitionKind::McpServer,
            LoadedDefinition::ServiceClass(_) => DefinitionKind::ServiceClass,
            LoadedDefinition::Workflow(_) => DefinitionKind::Workflow,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LoadedDefinition::McpServer(def) => &def.name,
            LoadedDefinition::ServiceClass(def) => &def.name,
            LoadedDefinition::Workflow(def) => &def.name,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            LoadedDefinition::McpServer(def) => def.validate(),
            LoadedDefinition::ServiceClass(def) => def.validate(),
            LoadedDefinition::Workflow(def) => def.validate(),
        }
    }
}

/// Thread-safe store of the current declarative state
pub struct DefinitionStore {
    mcp_servers: RwLock<HashMap<String, McpServerDefinition>>,
    service_classes: RwLock<HashMap<String, ServiceClassDefinition>>,
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    /// File path -> (kind, name), so deletion events can be mapped back
    path_index: RwLock<HashMap<PathBuf, (DefinitionKind, String)>>,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self {
            mcp_servers: RwLock::new(HashMap::new()),
            service_classes: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            path_index: RwLock::new(HashMap::new()),
        }
    }

    // -- MCPServer ----------------------------------------------------------

    pub fn put_mcp_server(&self, definition: McpServerDefinition) -> Result<()> {
        definition.validate()?;
        self.mcp_servers
            .write()
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn get_mcp_server(&self, name: &str) -> Option<McpServerDefinition> {
        self.mcp_servers.read().get(name).cloned()
    }

    pub fn list_mcp_servers(&self) -> Vec<McpServerDefinition> {
        let mut servers: Vec<_> = self.mcp_servers.read().values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    pub fn delete_mcp_server(&self, name: &str) -> Result<()> {
        self.mcp_servers
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MusterError::not_found("MCPServer", name))
    }

    // -- ServiceClass -------------------------------------------------------

    pub fn put_service_class(&self, definition: ServiceClassDefinition) -> Result<()> {
        definition.validate()?;
        self.service_classes
            .write()
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn get_service_class(&self, name: &str) -> Option<ServiceClassDefinition> {
        self.service_classes.read().get(name).cloned()
    }

    pub fn list_service_classes(&self) -> Vec<ServiceClassDefinition> {
        let mut classes: Vec<_> = self.service_classes.read().values().cloned().collect();
        classes.sort_by(|a, b| a.name.cmp(&b.name));
        classes
    }

    pub fn delete_service_class(&self, name: &str) -> Result<()> {
        self.service_classes
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MusterError::not_found("ServiceClass", name))
    }

    // -- Workflow -----------------------------------------------------------

    pub fn put_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        self.workflows
            .write()
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn get_workflow(&self, name: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().get(name).cloned()
    }

    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut workflows: Vec<_> = self.workflows.read().values().cloned().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        workflows
    }

    pub fn delete_workflow(&self, name: &str) -> Result<()> {
        self.workflows
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MusterError::not_found("Workflow", name))
    }

    // -- Filesystem loading -------------------------------------------------

    /// Parse one YAML file (possibly multi-document) into definitions
    pub fn parse_file(path: &Path) -> Result<Vec<LoadedDefinition>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MusterError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse_str(&content)
            .map_err(|e| e.context(format!("in {}", path.display())))
    }

    pub fn parse_str(content: &str) -> Result<Vec<LoadedDefinition>> {
        let mut definitions = Vec::new();
        for document in content.split("\n---") {
            if document.trim().is_empty() {
                continue;
            }
            let definition: LoadedDefinition = serde_yaml::from_str(document)?;
            definition.validate()?;
            definitions.push(definition);
        }
        Ok(definitions)
    }

    /// Load or reload one file into the store; returns what it defined.
    /// The path index remembers the mapping for later deletion events.
    pub fn load_file(&self, path: &Path) -> Result<Vec<(DefinitionKind, String)>> {
        let definitions = Self::parse_file(path)?;
        let mut loaded = Vec::new();
        for definition in definitions {
            let entry = (definition.kind(), definition.name().to_string());
            match definition {
                LoadedDefinition::McpServer(def) => self.put_mcp_server(def)?,
                LoadedDefinition::ServiceClass(def) => self.put_service_class(def)?,
                LoadedDefinition::Workflow(def) => self.put_workflow(def)?,
            }
            loaded.push(entry);
        }
        // One resource per file is the common layout; the index keeps the
        // first entry for deletion mapping.
        if let Some(first) = loaded.first() {
            self.path_index
                .write()
                .insert(path.to_path_buf(), first.clone());
        }
        Ok(loaded)
    }

    /// Map a deleted file back to the definition it held, removing it
    pub fn remove_path(&self, path: &Path) -> Option<(DefinitionKind, String)> {
        let (kind, name) = self.path_index.write().remove(path)?;
        let removed = match kind {
            DefinitionKind::McpServer => self.delete_mcp_server(&name).is_ok(),
            DefinitionKind::ServiceClass => self.delete_service_class(&name).is_ok(),
            DefinitionKind::Workflow => self.delete_workflow(&name).is_ok(),
        };
        removed.then_some((kind, name))
    }

    /// Load every .yaml/.yml file under the directory
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<(DefinitionKind, String)>> {
        let mut loaded = Vec::new();
        if !dir.exists() {
            return Ok(loaded);
        }
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| MusterError::config(format!("cannot read {}: {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        entries.sort();

        for path in entries {
            loaded.extend(self.load_file(&path)?);
        }
        Ok(loaded)
    }
}

impl Default for DefinitionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_YAML: &str = r#"
kind: MCPServer
name: k8s
transport:
  type: local-stdio
  command: kubectl-mcp
auto_start: true
tool_prefix: k8s
"#;

    const WORKFLOW_YAML: &str = r#"
kind: Workflow
name: debug-pods
args:
  namespace:
    type: string
    required: true
steps:
  - id: find-pods
    tool: x_kubernetes_get_pods
    args:
      namespace: "{{ .namespace }}"
    store: true
"#;

    #[test]
    fn test_parse_kinds() {
        let defs = DefinitionStore::parse_str(SERVER_YAML).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].kind(), DefinitionKind::McpServer);
        assert_eq!(defs[0].name(), "k8s");

        let defs = DefinitionStore::parse_str(WORKFLOW_YAML).unwrap();
        assert_eq!(defs[0].kind(), DefinitionKind::Workflow);
    }

    #[test]
    fn test_multi_document() {
        let combined = format!("{}\n---\n{}", SERVER_YAML, WORKFLOW_YAML);
        let defs = DefinitionStore::parse_str(&combined).unwrap();
        assert_eq!(defs.len(), 2);
    }

    #[test]
    fn test_invalid_definition_rejected() {
        let bad = r#"
kind: MCPServer
name: "bad name!"
transport:
  type: local-stdio
  command: x
"#;
        assert!(DefinitionStore::parse_str(bad).is_err());
    }

    #[test]
    fn test_store_crud() {
        let store = DefinitionStore::new();
        let defs = DefinitionStore::parse_str(SERVER_YAML).unwrap();
        let LoadedDefinition::McpServer(server) = defs.into_iter().next().unwrap() else {
            panic!("expected MCPServer");
        };

        store.put_mcp_server(server).unwrap();
        assert!(store.get_mcp_server("k8s").is_some());
        assert_eq!(store.list_mcp_servers().len(), 1);

        store.delete_mcp_server("k8s").unwrap();
        assert!(store.delete_mcp_server("k8s").is_err());
    }

    #[test]
    fn test_load_dir_and_remove_path() {
        let dir = tempfile::tempdir().unwrap();
        let server_path = dir.path().join("k8s.yaml");
        let workflow_path = dir.path().join("debug-pods.yaml");
        std::fs::write(&server_path, SERVER_YAML).unwrap();
        std::fs::write(&workflow_path, WORKFLOW_YAML).unwrap();

        let store = DefinitionStore::new();
        let loaded = store.load_dir(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(store.get_mcp_server("k8s").is_some());
        assert!(store.get_workflow("debug-pods").is_some());

        // A deletion event maps back through the path index.
        let removed = store.remove_path(&server_path).unwrap();
        assert_eq!(removed, (DefinitionKind::McpServer, "k8s".to_string()));
        assert!(store.get_mcp_server("k8s").is_none());
        assert!(store.remove_path(&server_path).is_none());
    }
}
