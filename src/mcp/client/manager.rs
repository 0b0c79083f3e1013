use super::{McpClient, McpClientError};
use crate::core::config::data::{Config, McpServerConfig};
use crate::mcp::protocol::{CallToolResult, ToolDefinition};
use crate::mcp::transport::{build_transport, Transport};
use futures_util::{stream, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MCP_STARTUP_CONCURRENCY_LIMIT: usize = 3;

pub type DynMcpClient = McpClient<Box<dyn Transport>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Failed,
}

/// A tool offered by a connected server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub server_id: String,
    pub definition: ToolDefinition,
}

pub struct McpServerState {
    pub config: McpServerConfig,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub tools: Vec<ToolDefinition>,
    client: Option<Arc<DynMcpClient>>,
}

impl McpServerState {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            tools: Vec::new(),
            client: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    fn record_failure(&mut self, err: impl ToString) {
        self.status = ConnectionStatus::Failed;
        self.last_error = Some(err.to_string());
    }
}

/// Owns one client per configured server and routes tool calls to the
/// server that advertises the tool.
#[derive(Default)]
pub struct McpClientManager {
    servers: Vec<McpServerState>,
}

impl McpClientManager {
    pub fn from_config(config: &Config) -> Self {
        let servers = config
            .mcp_servers
            .iter()
            .filter(|server| server.is_enabled())
            .cloned()
            .map(McpServerState::new)
            .collect();
        Self { servers }
    }

    /// Adds an already-built client, e.g. one over a custom transport.
    pub async fn attach(&mut self, config: McpServerConfig, client: DynMcpClient) {
        let mut state = McpServerState::new(config);
        let client = Arc::new(client);
        match client.list_tools().await {
            Ok(tools) => state.tools = tools,
            Err(err) => state.last_error = Some(err.to_string()),
        }
        state.status = ConnectionStatus::Connected;
        state.client = Some(client);
        self.servers.retain(|server| server.id() != state.id());
        self.servers.push(state);
    }

    pub fn servers(&self) -> impl Iterator<Item = &McpServerState> {
        self.servers.iter()
    }

    pub fn server(&self, id: &str) -> Option<&McpServerState> {
        self.servers
            .iter()
            .find(|server| server.id().eq_ignore_ascii_case(id))
    }

    /// Connects every configured server. One failing server does not stop
    /// the others; its error is kept on its state.
    pub async fn connect_all(&mut self) {
        let configs: Vec<McpServerConfig> = self
            .servers
            .iter()
            .filter(|server| !server.is_connected())
            .map(|server| server.config.clone())
            .collect();

        let results: Vec<(String, Result<(Arc<DynMcpClient>, Vec<ToolDefinition>), McpClientError>)> =
            stream::iter(configs)
                .map(|config| async move {
                    let result = connect_server(&config).await;
                    (config.id, result)
                })
                .buffer_unordered(MCP_STARTUP_CONCURRENCY_LIMIT)
                .collect()
                .await;

        for (id, result) in results {
            let Some(state) = self.servers.iter_mut().find(|server| server.id() == id) else {
                continue;
            };
            match result {
                Ok((client, tools)) => {
                    info!(server_id = %id, tools = tools.len(), "connected to tool server");
                    state.status = ConnectionStatus::Connected;
                    state.last_error = None;
                    state.tools = tools;
                    state.client = Some(client);
                }
                Err(err) => {
                    warn!(server_id = %id, error = %err, "failed to connect to tool server");
                    state.record_failure(err);
                }
            }
        }
    }

    /// Re-fetches the tool list of one server.
    pub async fn refresh_tools(&mut self, id: &str) -> Result<(), McpClientError> {
        let Some(state) = self
            .servers
            .iter_mut()
            .find(|server| server.id().eq_ignore_ascii_case(id))
        else {
            return Ok(());
        };
        let Some(client) = state.client.clone() else {
            return Ok(());
        };
        match client.list_tools().await {
            Ok(tools) => {
                state.tools = tools;
                state.last_error = None;
                Ok(())
            }
            Err(err) => {
                state.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Every tool offered by connected servers, tagged with the server id.
    pub fn tools(&self) -> Vec<RemoteTool> {
        self.servers
            .iter()
            .filter(|server| server.is_connected())
            .flat_map(|server| {
                server.tools.iter().map(|definition| RemoteTool {
                    server_id: server.id().to_string(),
                    definition: definition.clone(),
                })
            })
            .collect()
    }

    pub fn find_tool_server(&self, tool: &str) -> Option<&str> {
        self.servers
            .iter()
            .filter(|server| server.is_connected())
            .find(|server| server.tools.iter().any(|definition| definition.name == tool))
            .map(McpServerState::id)
    }

    pub async fn execute_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpClientError> {
        let server = self
            .servers
            .iter()
            .filter(|server| server.is_connected())
            .find(|server| server.tools.iter().any(|definition| definition.name == tool))
            .ok_or_else(|| McpClientError::UnknownTool(tool.to_string()))?;
        let client = server
            .client
            .clone()
            .ok_or_else(|| McpClientError::UnknownTool(tool.to_string()))?;
        debug!(server_id = %server.id(), tool, "calling remote tool");
        client.call_tool(tool, arguments).await
    }

    pub async fn disconnect_all(&mut self) {
        for server in &mut self.servers {
            if let Some(client) = server.client.take() {
                client.close().await;
            }
            server.status = ConnectionStatus::Disconnected;
            server.tools.clear();
        }
    }
}

async fn connect_server(
    config: &McpServerConfig,
) -> Result<(Arc<DynMcpClient>, Vec<ToolDefinition>), McpClientError> {
    debug!(server_id = %config.id, "connecting to tool server");
    let client = McpClient::new(build_transport(config)?);
    client.connect().await?;
    let tools = match client.list_tools().await {
        Ok(tools) => tools,
        Err(err) => {
            warn!(server_id = %config.id, error = %err, "failed to list tools");
            Vec::new()
        }
    };
    Ok((Arc::new(client), tools))
}
