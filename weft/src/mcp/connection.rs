//! Server connections: one transport + dispatcher + client per MCP server,
//! owned by the command/session that created them.

use std::sync::Arc;

use tracing::debug;

use crate::dispatch::ResponseDispatcher;
use crate::error::WeftError;
use crate::mcp::McpClient;
use crate::output::OutputWriter;
use crate::transport::{StdioTransport, TransportConfig};

/// A live connection to one MCP tool server.
///
/// Concurrent use is safe: writes serialize in the transport's write loop and
/// the dispatcher demuxes responses.
pub struct ServerConnection {
    name: String,
    client: McpClient,
}

impl ServerConnection {
    /// Spawns the server, wires the dispatcher, and completes the initialize
    /// handshake.
    pub async fn establish(
        name: &str,
        server: &config::ServerConfig,
        output: OutputWriter,
    ) -> Result<Self, WeftError> {
        let transport_config = TransportConfig {
            name: name.to_string(),
            command: server.command.clone(),
            args: server.args.clone(),
            env: server.env.clone(),
        };
        let (transport, inbound) = StdioTransport::spawn(transport_config, output.clone())?;

        let dispatcher = Arc::new(ResponseDispatcher::new());
        dispatcher.start(inbound);

        let client = McpClient::new(Arc::clone(&transport), dispatcher);
        if let Err(e) = client
            .initialize(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
            .await
        {
            transport.stop().await;
            return Err(e);
        }
        debug!(server = %name, "initialized");
        output.progress(&format!("connected to server {name}"));

        Ok(Self {
            name: name.to_string(),
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &McpClient {
        &self.client
    }

    /// Stops the underlying transport. The post-mortem stderr summary is
    /// emitted only when real errors were recorded.
    pub async fn shutdown(&self) {
        self.client.transport().stop().await;
    }
}

/// Establishes connections for the named servers out of an application
/// config, in order. Already-established connections are shut down when a
/// later one fails.
pub async fn connect_servers(
    app: &config::ApplicationConfig,
    names: &[String],
    output: &OutputWriter,
) -> Result<Vec<ServerConnection>, WeftError> {
    let mut connections: Vec<ServerConnection> = Vec::with_capacity(names.len());
    for name in names {
        let server = match app.servers.get(name) {
            Some(server) => server,
            None => {
                for conn in &connections {
                    conn.shutdown().await;
                }
                return Err(WeftError::new(
                    crate::error::ErrorCode::ServerNotFound,
                    format!("server {name:?} is not configured"),
                ));
            }
        };
        match ServerConnection::establish(name, server, output.clone()).await {
            Ok(conn) => connections.push(conn),
            Err(e) => {
                for conn in &connections {
                    conn.shutdown().await;
                }
                return Err(e);
            }
        }
    }
    Ok(connections)
}
