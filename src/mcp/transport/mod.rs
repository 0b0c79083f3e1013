//! Client-side transports for reaching JSON-RPC tool servers.
//!
//! Every transport exposes the same duplex contract: `send` delivers one
//! encoded request and yields the logical reply, while `receive` drains any
//! server-initiated messages that arrived out of band.

use crate::core::config::data::McpServerConfig;
use async_trait::async_trait;
use std::time::Duration;

pub mod sse;
pub mod stdio;

pub use sse::{SseEvent, SseEventParser, SseTransport};
pub use stdio::StdioTransport;

/// How long a freshly opened event stream may take to announce its endpoint.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body marker the server uses on 404 when a session id is unknown.
pub const SESSION_NOT_FOUND: &str = "Session not found";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Timeout: server did not send endpoint event within {}s", .0.as_secs_f32())]
    EndpointTimeout(Duration),
    #[error("event stream closed before an endpoint was announced")]
    StreamClosed,
    #[error("session expired and could not be re-established")]
    SessionExpired,
    #[error("transport is not connected")]
    NotConnected,
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
    #[error("unsupported transport: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Duplex message channel to a single tool server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the underlying connection. For SSE this waits for the endpoint.
    async fn start(&self) -> Result<(), TransportError>;

    /// Sends one encoded message. Returns the reply body, or `None` when the
    /// server acknowledged without a payload.
    async fn send(&self, message: String) -> Result<Option<String>, TransportError>;

    /// Next server-pushed message, or `None` once the transport is closed.
    async fn receive(&self) -> Option<String>;

    async fn close(&self);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn start(&self) -> Result<(), TransportError> {
        (**self).start().await
    }

    async fn send(&self, message: String) -> Result<Option<String>, TransportError> {
        (**self).send(message).await
    }

    async fn receive(&self) -> Option<String> {
        (**self).receive().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Supported transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    Sse,
    Stdio,
}

impl McpTransportKind {
    /// Resolves transport type from config, defaulting to SSE.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, TransportError> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("sse")
            .to_ascii_lowercase();
        match transport.as_str() {
            "sse" | "http" | "http+sse" => Ok(McpTransportKind::Sse),
            "stdio" => Ok(McpTransportKind::Stdio),
            other => Err(TransportError::Unsupported(other.to_string())),
        }
    }
}

/// Builds the transport described by a server entry.
pub fn build_transport(config: &McpServerConfig) -> Result<Box<dyn Transport>, TransportError> {
    match McpTransportKind::from_config(config)? {
        McpTransportKind::Sse => {
            let base_url = config.base_url.as_deref().ok_or_else(|| {
                TransportError::Config("base_url is required for SSE transport".to_string())
            })?;
            let mut transport = SseTransport::new(base_url)?
                .with_endpoint_timeout(config.endpoint_timeout());
            if let Some(token) = config.auth_token.as_deref() {
                transport = transport.with_bearer_token(token)?;
            }
            Ok(Box::new(transport))
        }
        McpTransportKind::Stdio => {
            let command = config.command.clone().ok_or_else(|| {
                TransportError::Config("command is required for stdio transport".to_string())
            })?;
            let transport = StdioTransport::new(command)
                .with_args(config.args.clone().unwrap_or_default())
                .with_env(config.env.clone().unwrap_or_default());
            Ok(Box::new(transport))
        }
    }
}
