//! Stdio MCP server surface.
//!
//! Line-delimited JSON-RPC on stdin/stdout. Only the consumed subset is
//! served: `initialize`, `tools/list`, `tools/call`. Notifications are
//! accepted and ignored; unknown methods answer -32601. Stdout carries
//! protocol traffic only; diagnostics go to stderr via tracing.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use weft::{JsonRpcMessage, WeftError};

use crate::catalog::ToolCatalog;

const METHOD_NOT_FOUND: i64 = -32601;

/// Server identity advertised in the initialize result.
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
}

impl ServerIdentity {
    pub fn from_config(info: Option<&config::ServerInfo>) -> Self {
        Self {
            name: info
                .map(|i| i.name.clone())
                .unwrap_or_else(|| "weft".to_string()),
            version: info
                .and_then(|i| i.version.clone())
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

/// Serves the catalog over stdin/stdout until EOF.
pub async fn serve_stdio(
    catalog: Arc<ToolCatalog>,
    identity: ServerIdentity,
) -> Result<(), WeftError> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await.map_err(|e| {
            WeftError::new(weft::ErrorCode::Internal, "stdin read failed").with_cause(e)
        })?;
        if read == 0 {
            debug!("stdin closed; MCP server exiting");
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message: JsonRpcMessage = match serde_json::from_str(trimmed) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "discarding malformed inbound line");
                continue;
            }
        };

        let Some(response) = handle_message(&catalog, &identity, message).await else {
            continue;
        };
        let mut bytes = serde_json::to_vec(&response).map_err(|e| {
            WeftError::new(weft::ErrorCode::Internal, "response encode failed").with_cause(e)
        })?;
        bytes.push(b'\n');
        stdout.write_all(&bytes).await.map_err(|e| {
            WeftError::new(weft::ErrorCode::Internal, "stdout write failed").with_cause(e)
        })?;
        stdout.flush().await.map_err(|e| {
            WeftError::new(weft::ErrorCode::Internal, "stdout flush failed").with_cause(e)
        })?;
    }
}

/// Handles one inbound message; `None` for notifications.
pub async fn handle_message(
    catalog: &ToolCatalog,
    identity: &ServerIdentity,
    message: JsonRpcMessage,
) -> Option<JsonRpcMessage> {
    if message.is_notification() {
        debug!(method = message.method.as_deref().unwrap_or(""), "ignoring notification");
        return None;
    }
    let id = message.id.clone()?;
    let method = message.method.as_deref().unwrap_or("");

    let response = match method {
        "initialize" => JsonRpcMessage::response(
            id,
            json!({
                "protocolVersion": weft::mcp::PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": identity.name, "version": identity.version },
            }),
        ),
        "tools/list" => {
            let tools: Vec<Value> = catalog
                .tools()
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "inputSchema": tool.input_schema,
                    })
                })
                .collect();
            JsonRpcMessage::response(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let params = message.params.unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            match catalog.call(name, arguments).await {
                Ok(text) => JsonRpcMessage::response(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }],
                        "isError": false,
                    }),
                ),
                Err(e) => JsonRpcMessage::response(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": e.to_string() }],
                        "isError": true,
                    }),
                ),
            }
        }
        "ping" => JsonRpcMessage::response(id, json!({})),
        other => {
            warn!(method = %other, "unknown method");
            JsonRpcMessage::error_response(
                Some(id),
                METHOD_NOT_FOUND,
                format!("method {other:?} is not supported"),
            )
        }
    };
    Some(response)
}

