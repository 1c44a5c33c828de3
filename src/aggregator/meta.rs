//! Meta-tools
//!
//! Discovery and dispatch tools the aggregator itself serves to the agent:
//! list_tools, filter_tools, describe_tool, call_tool. They read the calling
//! session's catalog snapshot.

use super::Aggregator;
use crate::constants::{META_TOOL_CALL, META_TOOL_DESCRIBE, META_TOOL_FILTER, META_TOOL_LIST};
use crate::model::ToolDescriptor;
use crate::{MusterError, Result};
use serde_json::{Value, json};
use std::sync::Arc;

pub fn is_meta_tool(name: &str) -> bool {
    matches!(
        name,
        META_TOOL_LIST | META_TOOL_FILTER | META_TOOL_DESCRIBE | META_TOOL_CALL
    )
}

/// Descriptors for the meta-tools, present in every catalog
pub fn meta_tool_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: META_TOOL_LIST.to_string(),
            description: Some("List all tools available in this session".to_string()),
            input_schema: json!({"type": "object", "properties": {}}),
            server: Some("muster".to_string()),
        },
        ToolDescriptor {
            name: META_TOOL_FILTER.to_string(),
            description: Some(
                "Filter available tools by a substring over names and descriptions".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Substring to match"}
                },
                "required": ["pattern"]
            }),
            server: Some("muster".to_string()),
        },
        ToolDescriptor {
            name: META_TOOL_DESCRIBE.to_string(),
            description: Some("Describe one tool, including its input schema".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Tool name"}
                },
                "required": ["name"]
            }),
            server: Some("muster".to_string()),
        },
        ToolDescriptor {
            name: META_TOOL_CALL.to_string(),
            description: Some("Call a tool by name with arguments".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Tool name"},
                    "args": {"type": "object", "description": "Tool arguments"}
                },
                "required": ["name"]
            }),
            server: Some("muster".to_string()),
        },
    ]
}

pub async fn call_meta_tool(
    aggregator: &Arc<Aggregator>,
    session: Option<&str>,
    name: &str,
    args: Value,
) -> Result<Value> {
    match name {
        META_TOOL_LIST => {
            let tools = aggregator.list_tools(session).await;
            Ok(json!({"tools": tools}))
        }
        META_TOOL_FILTER => {
            let pattern = args
                .get("pattern")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MusterError::validation("filter_tools requires 'pattern'"))?;
            let catalog = aggregator.session_catalog(session).await;
            let matched: Vec<&ToolDescriptor> = catalog.filter_tools(pattern);
            Ok(json!({"tools": matched}))
        }
        META_TOOL_DESCRIBE => {
            let tool_name = args
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MusterError::validation("describe_tool requires 'name'"))?;
            let catalog = aggregator.session_catalog(session).await;
            let tool = catalog
                .find_tool(tool_name)
                .ok_or_else(|| MusterError::not_found("tool", tool_name))?;
            Ok(serde_json::to_value(tool)?)
        }
        META_TOOL_CALL => {
            let tool_name = args
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MusterError::validation("call_tool requires 'name'"))?;
            if is_meta_tool(tool_name) {
                return Err(MusterError::validation(
                    "call_tool cannot dispatch meta-tools",
                ));
            }
            let inner_args = args.get("args").cloned().unwrap_or_else(|| json!({}));
            Box::pin(aggregator.call_tool(session, tool_name, inner_args)).await
        }
        other => Err(MusterError::not_found("tool", other)),
    }
}
