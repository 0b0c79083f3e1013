//! Typed JSON-RPC client over any [`Transport`].

use crate::mcp::protocol::{
    methods, CallToolParams, CallToolResult, Implementation, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, RequestId, RpcError, ToolDefinition, PROTOCOL_VERSION,
};
use crate::mcp::transport::{Transport, TransportError};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

mod manager;

pub use manager::{ConnectionStatus, McpClientManager, McpServerState, RemoteTool};

#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server returned error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("server sent no reply to `{0}`")]
    EmptyReply(String),
    #[error("reply id {received:?} does not match request id {expected}")]
    MismatchedId {
        expected: RequestId,
        received: Option<RequestId>,
    },
    #[error("no connected server provides tool `{0}`")]
    UnknownTool(String),
}

impl McpClientError {
    /// True when the failure is in reaching the server rather than in the
    /// server's handling of the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, McpClientError::Transport(_))
    }
}

pub struct McpClient<T: Transport> {
    transport: T,
    client_info: Implementation,
    next_request_id: AtomicI64,
    server_details: RwLock<Option<InitializeResult>>,
}

impl<T: Transport> McpClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            next_request_id: AtomicI64::new(0),
            server_details: RwLock::new(None),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn server_details(&self) -> Option<InitializeResult> {
        self.server_details
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts the transport and performs the initialize handshake.
    pub async fn connect(&self) -> Result<InitializeResult, McpClientError> {
        self.transport.start().await?;
        self.initialize().await
    }

    pub async fn initialize(&self) -> Result<InitializeResult, McpClientError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": self.client_info,
        });
        let result: InitializeResult = self.request(methods::INITIALIZE, Some(params)).await?;
        debug!(
            server = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "initialized"
        );
        *self
            .server_details
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        self.notify(methods::NOTIFICATIONS_INITIALIZED, None).await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpClientError> {
        let result: ListToolsResult = self.request(methods::TOOLS_LIST, None).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpClientError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        self.request(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn ping(&self) -> Result<(), McpClientError> {
        let _: Value = self.request(methods::PING, None).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpClientError> {
        let payload = serde_json::to_string(&JsonRpcRequest::notification(method, params))?;
        self.transport.send(payload).await?;
        Ok(())
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R, McpClientError> {
        let id = RequestId::from(self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1);
        let payload = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;
        debug!(method, id = %id, "sending request");

        let reply = self
            .transport
            .send(payload)
            .await?
            .ok_or_else(|| McpClientError::EmptyReply(method.to_string()))?;
        let response: JsonRpcResponse = serde_json::from_str(&reply)?;
        if response.id.as_ref() != Some(&id) {
            return Err(McpClientError::MismatchedId {
                expected: id,
                received: response.id,
            });
        }
        let result = response.into_result().map_err(McpClientError::Rpc)?;
        Ok(serde_json::from_value(result)?)
    }
}
