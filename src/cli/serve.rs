use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::config::data::Config;
use crate::mcp::dispatcher::McpDispatcher;
use crate::mcp::protocol::Implementation;
use crate::mcp::registry::ToolRegistry;
use crate::mcp::server::{serve, serve_stdio, ServerState, MESSAGE_PATH, SSE_PATH};
use crate::tools::BuiltinTools;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServeOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub stdio: bool,
    pub no_auth: bool,
}

pub fn build_dispatcher(config: &Config) -> Result<McpDispatcher, Box<dyn Error>> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register_plugin(&BuiltinTools::new()?);
    let server_info = Implementation::new(config.server.name(), config.server.version());
    Ok(McpDispatcher::new(registry, server_info))
}

pub async fn run_server(config: &Config, options: ServeOptions) -> Result<(), Box<dyn Error>> {
    let dispatcher = build_dispatcher(config)?;

    if options.stdio {
        info!(tools = dispatcher.registry().len(), "serving on stdio");
        serve_stdio(&dispatcher).await?;
        return Ok(());
    }

    let api_key = if options.no_auth {
        None
    } else {
        config.server.resolved_api_key()
    };
    if api_key.is_none() {
        warn!("no API key configured; the tool server accepts unauthenticated requests");
    }

    let host = options.host.as_deref().unwrap_or(config.server.host());
    let port = options.port.unwrap_or(config.server.port());
    let listener = TcpListener::bind((host, port)).await?;
    let address = listener.local_addr()?;
    eprintln!("🚀 Serving {} tools on http://{address}", dispatcher.registry().len());
    eprintln!("   event stream: http://{address}{SSE_PATH}");
    eprintln!("   messages:     http://{address}{MESSAGE_PATH}?sessionId=<id>");

    let state = ServerState::new(Arc::new(dispatcher)).with_api_key(api_key);
    serve(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}
