//! Tool definitions in model-provider function-calling shapes.

use serde_json::{json, Value};

use super::types::McpToolDefinition;

/// Provider wire format for tool definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFormat {
    /// `{type: "function", function: {name, description, parameters}}`
    OpenAi,
    /// `{name, description, input_schema}`
    Anthropic,
    /// `{name, description, parameters}`
    Gemini,
}

impl ToolFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }
}

/// Schema used when a server publishes a tool without one.
pub fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Convert one tool definition.
pub fn convert(tool: &McpToolDefinition, format: ToolFormat) -> Value {
    let schema = tool.input_schema.clone().unwrap_or_else(empty_schema);
    match format {
        ToolFormat::OpenAi => json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": schema,
            }
        }),
        ToolFormat::Anthropic => json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": schema,
        }),
        ToolFormat::Gemini => json!({
            "name": tool.name,
            "description": tool.description,
            "parameters": schema,
        }),
    }
}

/// Convert a server's whole tool list, preserving order.
pub fn convert_all(tools: &[McpToolDefinition], format: ToolFormat) -> Vec<Value> {
    tools.iter().map(|t| convert(t, format)).collect()
}
