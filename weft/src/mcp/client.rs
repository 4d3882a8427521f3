//! MCP client: request/response over one stdio transport.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use super::{CallToolResult, ToolInfo, ToolsListResult, PROTOCOL_VERSION};
use crate::dispatch::ResponseDispatcher;
use crate::error::{ErrorCode, WeftError};
use crate::jsonrpc::JsonRpcMessage;
use crate::transport::StdioTransport;

/// Default per-operation timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// The initialize handshake gets a shorter leash: a server that cannot even
/// greet is not going to recover.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);

/// Typed MCP operations over a transport + dispatcher pair.
pub struct McpClient {
    transport: Arc<StdioTransport>,
    dispatcher: Arc<ResponseDispatcher>,
    next_id: AtomicI64,
    request_timeout: Duration,
}

impl McpClient {
    pub fn new(transport: Arc<StdioTransport>, dispatcher: Arc<ResponseDispatcher>) -> Self {
        Self {
            transport,
            dispatcher,
            next_id: AtomicI64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn server_name(&self) -> &str {
        self.transport.name()
    }

    pub fn transport(&self) -> &Arc<StdioTransport> {
        &self.transport
    }

    /// Performs the initialize handshake and sends
    /// `notifications/initialized`.
    pub async fn initialize(&self, client_name: &str, client_version: &str) -> Result<(), WeftError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": { "name": client_name, "version": client_version },
        });
        self.request("initialize", params, INITIALIZE_TIMEOUT)
            .await?;
        self.transport
            .write(JsonRpcMessage::notification(
                "notifications/initialized",
                Some(json!({})),
            ))
            .await?;
        Ok(())
    }

    /// `tools/list`: the server's ordered tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, WeftError> {
        let result = self
            .request("tools/list", json!({}), self.request_timeout)
            .await?;
        let parsed: ToolsListResult = serde_json::from_value(result).map_err(|e| {
            WeftError::new(ErrorCode::Internal, "malformed tools/list result")
                .with_cause(e)
                .with_context("server", self.server_name())
        })?;
        Ok(parsed.tools)
    }

    /// `tools/call`: invoke one tool and reduce the result to text.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, WeftError> {
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                self.request_timeout,
            )
            .await?;
        let parsed: CallToolResult = serde_json::from_value(result).map_err(|e| {
            WeftError::new(ErrorCode::Internal, "malformed tools/call result")
                .with_cause(e)
                .with_context("tool", name)
        })?;
        if parsed.is_error {
            return Err(
                WeftError::new(ErrorCode::ToolExecutionError, parsed.text())
                    .with_context("tool", name)
                    .with_context("server", self.server_name()),
            );
        }
        Ok(parsed.text())
    }

    /// Sends one request and awaits its correlated response.
    ///
    /// Registration happens before the write, per the dispatcher contract.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, WeftError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = id.to_string();
        let mut rx = self.dispatcher.register_request(&key).await;

        if let Err(e) = self
            .transport
            .write(JsonRpcMessage::request(id, method, params))
            .await
        {
            self.dispatcher.unregister_request(&key).await;
            return Err(e);
        }

        let msg = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                return Err(WeftError::new(
                    ErrorCode::ServerStopped,
                    format!("server closed while awaiting {method}"),
                )
                .with_context("server", self.server_name()));
            }
            Err(_) => {
                self.dispatcher.unregister_request(&key).await;
                return Err(WeftError::new(
                    ErrorCode::ToolExecutionError,
                    format!("{method} timed out after {timeout:?}"),
                )
                .with_context("server", self.server_name()));
            }
        };

        if let Some(err) = msg.error {
            debug!(server = %self.server_name(), %method, code = err.code, "server returned error");
            return Err(WeftError::new(
                ErrorCode::ToolExecutionError,
                format!("{method} failed: {}", err.message),
            )
            .with_context("server", self.server_name())
            .with_context("rpc_code", err.code.to_string()));
        }
        msg.result.ok_or_else(|| {
            WeftError::new(ErrorCode::Internal, format!("{method} response had no result"))
        })
    }
}
