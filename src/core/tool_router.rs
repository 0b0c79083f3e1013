//! Routes model tool calls to built-in local tools or to connected servers.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::message::ToolCall;
use crate::core::orchestrator::{ToolExecutor, ToolOutcome};
use crate::mcp::client::{McpClientError, McpClientManager};
use crate::mcp::protocol::{FewShotExample, ToolDefinition};
use crate::mcp::transport::TransportError;

pub const LIST_MCP_TOOLS: &str = "list_mcp_tools";
pub const CURRENT_DATETIME: &str = "current_datetime";

pub const LOCAL_TOOL_NAMES: [&str; 2] = [LIST_MCP_TOOLS, CURRENT_DATETIME];

pub fn is_local_tool(name: &str) -> bool {
    LOCAL_TOOL_NAMES.contains(&name)
}

fn local_tool_definitions() -> Vec<ToolDefinition> {
    let no_arguments = json!({"type": "object", "properties": {}});
    vec![
        ToolDefinition {
            name: LIST_MCP_TOOLS.to_string(),
            description: "List every tool offered by the connected tool servers. Call this when the user asks what you can do or which tools and services are available.".to_string(),
            input_schema: no_arguments.clone(),
            few_shot_examples: Some(vec![FewShotExample {
                request: "Which tools do you have?".to_string(),
                params: Default::default(),
            }]),
            negative_examples: None,
        },
        ToolDefinition {
            name: CURRENT_DATETIME.to_string(),
            description: "Current date and time in UTC.".to_string(),
            input_schema: no_arguments,
            few_shot_examples: Some(vec![FewShotExample {
                request: "What day is it today?".to_string(),
                params: Default::default(),
            }]),
            negative_examples: None,
        },
    ]
}

/// [`ToolExecutor`] over the local built-ins and an [`McpClientManager`].
#[derive(Clone)]
pub struct ToolRouter {
    manager: Arc<RwLock<McpClientManager>>,
}

impl ToolRouter {
    pub fn new(manager: Arc<RwLock<McpClientManager>>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<RwLock<McpClientManager>> {
        &self.manager
    }

    async fn list_mcp_tools(&self) -> String {
        let manager = self.manager.read().await;
        let remote: Vec<Value> = manager
            .tools()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.definition.name,
                    "description": tool.definition.description,
                    "server_id": tool.server_id,
                    "parameters": tool.definition.input_schema,
                })
            })
            .collect();
        let local: Vec<Value> = local_tool_definitions()
            .into_iter()
            .filter(|tool| tool.name != LIST_MCP_TOOLS)
            .map(|tool| json!({"name": tool.name, "description": tool.description, "type": "local"}))
            .collect();
        json!({
            "total_count": remote.len(),
            "tools": remote,
            "local_tools": local,
        })
        .to_string()
    }

    fn current_datetime() -> String {
        let now = Utc::now();
        json!({
            "iso8601": now.to_rfc3339(),
            "unix": now.timestamp(),
            "weekday": now.format("%A").to_string(),
        })
        .to_string()
    }
}

#[async_trait]
impl ToolExecutor for ToolRouter {
    async fn available_tools(&self) -> Vec<ToolDefinition> {
        let mut tools = local_tool_definitions();
        let manager = self.manager.read().await;
        tools.extend(
            manager
                .tools()
                .into_iter()
                .map(|tool| tool.definition)
                .filter(|definition| !is_local_tool(&definition.name)),
        );
        tools
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, TransportError> {
        match call.name.as_str() {
            LIST_MCP_TOOLS => {
                debug!(tool = %call.name, "running local tool");
                return Ok(ToolOutcome::Completed(self.list_mcp_tools().await));
            }
            CURRENT_DATETIME => {
                debug!(tool = %call.name, "running local tool");
                return Ok(ToolOutcome::Completed(Self::current_datetime()));
            }
            _ => {}
        }

        debug!(tool = %call.name, "dispatching remote tool");
        let manager = self.manager.read().await;
        match manager.execute_tool(&call.name, call.arguments.clone()).await {
            Ok(result) if result.is_error => Ok(ToolOutcome::Failed(result.text())),
            Ok(result) => Ok(ToolOutcome::Completed(result.text())),
            Err(McpClientError::Transport(err)) => Err(err),
            Err(err) => Ok(ToolOutcome::Failed(err.to_string())),
        }
    }
}
