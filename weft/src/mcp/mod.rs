//! MCP message layer: the subset of the protocol this runtime consumes.
//!
//! Typed helpers for `initialize`, `tools/list`, and `tools/call` over a
//! [`StdioTransport`](crate::transport::StdioTransport) +
//! [`ResponseDispatcher`](crate::dispatch::ResponseDispatcher) pair.
//! Notifications from the server are accepted and ignored.

mod client;
mod connection;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::McpClient;
pub use connection::{connect_servers, ServerConnection};

/// Protocol version sent in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// One tool advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema for the tool input; `"type": "object"` at the top level.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
}

/// One content block of a `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// `tools/call` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Extracts the text of the first text-type content block; when none
    /// exists, the whole content array marshaled to JSON is the fallback.
    pub fn text(&self) -> String {
        for block in &self.content {
            if block.kind == "text" {
                if let Some(text) = &block.text {
                    return text.clone();
                }
            }
        }
        serde_json::to_string(&self.content).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_result_prefers_first_text_block() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "image", "data": "...base64..."},
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ]
        }))
        .unwrap();
        assert_eq!(result.text(), "first");
    }

    #[test]
    fn call_result_falls_back_to_json() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "image", "data": "zzz"}]
        }))
        .unwrap();
        let text = result.text();
        assert!(text.contains("image"));
        assert!(text.contains("zzz"));
    }

    #[test]
    fn tools_list_parses_input_schema() {
        let result: ToolsListResult = serde_json::from_value(json!({
            "tools": [
                {"name": "search", "description": "find things",
                 "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}}
            ]
        }))
        .unwrap();
        assert_eq!(result.tools[0].name, "search");
        assert_eq!(result.tools[0].input_schema["type"], "object");
    }
}
