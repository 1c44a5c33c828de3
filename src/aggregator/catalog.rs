//! Per-session catalog assembly
//!
//! The catalog a session sees is the union of tools, resources, and prompts
//! from every healthy backing server visible to it, with each server's
//! tool_prefix applied. Catalogs are immutable snapshots; updates swap the
//! whole Arc so readers never take a lock.

use crate::model::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use crate::{MusterError, Result};
use std::collections::HashMap;

/// Apply a server's prefix to a raw tool name
pub fn prefixed_name(prefix: Option<&str>, tool: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}_{}", prefix, tool),
        None => tool.to_string(),
    }
}

/// Strip a server's prefix from an externally visible name
pub fn strip_prefix<'a>(prefix: Option<&str>, name: &'a str) -> Option<&'a str> {
    match prefix {
        Some(prefix) => name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_')),
        None => Some(name),
    }
}

/// Immutable snapshot of what one session can see
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    /// Externally visible tool name -> owning server
    pub tool_owners: HashMap<String, String>,
    /// Server-set generation this snapshot was built from
    pub generation: u64,
}

impl Catalog {
    pub fn find_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn owner_of(&self, tool: &str) -> Option<&str> {
        self.tool_owners.get(tool).map(|s| s.as_str())
    }

    /// Case-insensitive substring filter over names and descriptions
    pub fn filter_tools(&self, pattern: &str) -> Vec<&ToolDescriptor> {
        let needle = pattern.to_lowercase();
        self.tools
            .iter()
            .filter(|tool| {
                tool.name.to_lowercase().contains(&needle)
                    || tool
                        .description
                        .as_ref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

/// Incrementally assembles a catalog, rejecting tool-name collisions
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    catalog: Catalog,
}

impl CatalogBuilder {
    pub fn new(generation: u64) -> Self {
        Self {
            catalog: Catalog {
                generation,
                ..Default::default()
            },
        }
    }

    /// Add one server's entries under its prefix. Fails when a prefixed name
    /// collides with one already present.
    pub fn add_server(
        &mut self,
        server: &str,
        prefix: Option<&str>,
        tools: &[ToolDescriptor],
        resources: &[ResourceDescriptor],
        prompts: &[PromptDescriptor],
    ) -> Result<()> {
        for tool in tools {
            let visible = prefixed_name(prefix, &tool.name);
            if let Some(existing) = self.catalog.tool_owners.get(&visible) {
                return Err(MusterError::validation(format!(
                    "tool name '{}' from server '{}' collides with server '{}'",
                    visible, server, existing
                )));
            }
            self.catalog
                .tool_owners
                .insert(visible.clone(), server.to_string());
            self.catalog.tools.push(ToolDescriptor {
                name: visible,
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
                server: Some(server.to_string()),
            });
        }

        for resource in resources {
            self.catalog.resources.push(ResourceDescriptor {
                server: Some(server.to_string()),
                ..resource.clone()
            });
        }
        for prompt in prompts {
            self.catalog.prompts.push(PromptDescriptor {
                name: prefixed_name(prefix, &prompt.name),
                description: prompt.description.clone(),
                arguments: prompt.arguments.clone(),
                server: Some(server.to_string()),
            });
        }

        Ok(())
    }

    /// Add control-plane tools (meta-tools, core operations, workflows)
    pub fn add_builtin_tools(&mut self, tools: Vec<ToolDescriptor>) {
        for tool in tools {
            // Built-ins register first and never collide with each other;
            // a backing server clashing with a built-in loses.
            if self.catalog.tool_owners.contains_key(&tool.name) {
                continue;
            }
            self.catalog
                .tool_owners
                .insert(tool.name.clone(), "muster".to_string());
            self.catalog.tools.push(tool);
        }
    }

    pub fn build(self) -> Catalog {
        self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: Some(format!("{} tool", name)),
            input_schema: json!({"type": "object"}),
            server: None,
        }
    }

    #[test]
    fn test_prefixing() {
        assert_eq!(prefixed_name(Some("k8s"), "get_pods"), "k8s_get_pods");
        assert_eq!(prefixed_name(None, "get_pods"), "get_pods");

        assert_eq!(strip_prefix(Some("k8s"), "k8s_get_pods"), Some("get_pods"));
        assert_eq!(strip_prefix(Some("k8s"), "other_get_pods"), None);
        assert_eq!(strip_prefix(None, "get_pods"), Some("get_pods"));
    }

    #[test]
    fn test_collision_rejected() {
        let mut builder = CatalogBuilder::new(1);
        builder
            .add_server("a", Some("x"), &[tool("get_pods")], &[], &[])
            .unwrap();

        // Same prefix + same tool name from another server collides.
        let err = builder
            .add_server("b", Some("x"), &[tool("get_pods")], &[], &[])
            .unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn test_distinct_prefixes_do_not_collide() {
        let mut builder = CatalogBuilder::new(1);
        builder
            .add_server("a", Some("k8s"), &[tool("get_pods")], &[], &[])
            .unwrap();
        builder
            .add_server("b", Some("prom"), &[tool("get_pods")], &[], &[])
            .unwrap();

        let catalog = builder.build();
        assert_eq!(catalog.tools.len(), 2);
        assert_eq!(catalog.owner_of("k8s_get_pods"), Some("a"));
        assert_eq!(catalog.owner_of("prom_get_pods"), Some("b"));
    }

    #[test]
    fn test_filter_tools() {
        let mut builder = CatalogBuilder::new(1);
        builder
            .add_server("a", Some("k8s"), &[tool("get_pods"), tool("get_logs")], &[], &[])
            .unwrap();
        let catalog = builder.build();

        assert_eq!(catalog.filter_tools("pods").len(), 1);
        assert_eq!(catalog.filter_tools("K8S").len(), 2);
        assert!(catalog.filter_tools("nothing").is_empty());
    }
}
