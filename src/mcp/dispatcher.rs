use crate::mcp::protocol::{
    methods, CallToolResult, Implementation, InitializeResult, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, RpcError, ServerCapabilities, ToolsCapability, PROTOCOL_VERSION,
};
use crate::mcp::registry::{Tool, ToolRegistry};
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps raw JSON-RPC payloads to responses against a [`ToolRegistry`].
///
/// Every fault (undecodable payload, unknown method, bad parameters, a tool
/// that errors or panics) is converted into an error response. Notifications
/// never produce a response.
#[derive(Clone)]
pub struct McpDispatcher {
    registry: Arc<ToolRegistry>,
    server_info: Implementation,
}

impl McpDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, server_info: Implementation) -> Self {
        Self {
            registry,
            server_info,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    /// Handles one encoded message. Returns the encoded response, or `None`
    /// for notifications.
    pub async fn handle(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let request = match serde_json::from_slice::<JsonRpcRequest>(raw) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "rejecting undecodable JSON-RPC payload");
                return Some(encode_response(&JsonRpcResponse::failure(
                    None,
                    RpcError::parse_error(err),
                )));
            }
        };
        let response = self.handle_request(request).await?;
        Some(encode_response(&response))
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.jsonrpc != "2.0" {
            debug!(version = %request.jsonrpc, "serving request with non-2.0 jsonrpc tag");
        }
        debug!(method = %request.method, id = ?request.id, "dispatching");

        let outcome = match request.method.as_str() {
            methods::INITIALIZE => Ok(self.initialize()),
            methods::INITIALIZED | methods::NOTIFICATIONS_INITIALIZED => Ok(json!({})),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(self.list_tools()),
            methods::TOOLS_CALL => self.call_tool(request.params).await,
            other => Err(RpcError::method_not_found(other)),
        };

        let id = request.id?;
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(Some(id), result),
            Err(error) => JsonRpcResponse::failure(Some(id), error),
        })
    }

    fn initialize(&self) -> Value {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: self.server_info.clone(),
        };
        serde_json::to_value(result).unwrap_or_else(|_| json!({}))
    }

    fn list_tools(&self) -> Value {
        let result = ListToolsResult {
            tools: self.registry.list(),
        };
        serde_json::to_value(result).unwrap_or_else(|_| json!({ "tools": [] }))
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let Some(Value::Object(params)) = params else {
            return Err(RpcError::invalid_params("Missing params for tools/call"));
        };
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("Missing tool name"))?;
        let arguments = match params.get("arguments") {
            Some(Value::Object(arguments)) => arguments.clone(),
            Some(Value::Null) | None => {
                return Err(RpcError::invalid_params("Missing tool arguments"))
            }
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "Tool arguments must be a JSON object",
                ))
            }
        };

        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| RpcError::invalid_params(format!("Tool not found: {name}")))?;

        validate_arguments(tool.as_ref(), &arguments)?;

        let execution = AssertUnwindSafe(tool.execute(arguments)).catch_unwind().await;
        let output = match execution {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(tool = %name, error = %err, "tool execution failed");
                return Err(RpcError::tool_execution(format!(
                    "Tool execution error: {err}"
                )));
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(tool = %name, panic = %message, "tool panicked");
                return Err(RpcError::tool_execution(format!(
                    "Tool execution error: {message}"
                )));
            }
        };

        serde_json::to_value(CallToolResult::from(output))
            .map_err(|err| RpcError::internal(format!("Failed to encode tool result: {err}")))
    }
}

fn validate_arguments(tool: &dyn Tool, arguments: &Map<String, Value>) -> Result<(), RpcError> {
    let schema = tool.descriptor().input_schema.to_json();
    let validator = match jsonschema::validator_for(&schema) {
        Ok(validator) => validator,
        Err(err) => {
            warn!(tool = %tool.name(), error = %err, "skipping argument validation; schema is invalid");
            return Ok(());
        }
    };
    let instance = Value::Object(arguments.clone());
    validator
        .validate(&instance)
        .map_err(|err| RpcError::invalid_params(format!("Invalid arguments for {}: {err}", tool.name())))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tool panicked".to_string()
    }
}

fn encode_response(response: &JsonRpcResponse) -> Vec<u8> {
    serde_json::to_vec(response).unwrap_or_else(|err| {
        format!(
            r#"{{"jsonrpc":"2.0","error":{{"code":-32603,"message":"Failed to encode response: {}"}}}}"#,
            err.to_string().replace('"', "'")
        )
        .into_bytes()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, TOOL_EXECUTION_ERROR};
    use crate::mcp::registry::tests::StaticTool;
    use crate::mcp::registry::{PropertySchema, ToolDescriptor, ToolError, ToolOutput};
    use async_trait::async_trait;

    struct ShoutTool {
        descriptor: ToolDescriptor,
    }

    impl ShoutTool {
        fn new() -> Arc<dyn Tool> {
            Arc::new(Self {
                descriptor: ToolDescriptor::new("shout", "Uppercases text")
                    .with_required_property("text", PropertySchema::string()),
            })
        }
    }

    #[async_trait]
    impl Tool for ShoutTool {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn execute(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
            let text = arguments
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match text {
                "fail" => Err(ToolError::execution("refusing to shout")),
                "panic" => panic!("shout tool exploded"),
                "soft" => Ok(ToolOutput::failure("nothing to shout")),
                _ => Ok(ToolOutput::text(text.to_uppercase())),
            }
        }
    }

    fn dispatcher() -> McpDispatcher {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(ShoutTool::new());
        registry.register(StaticTool::new("echo", "X"));
        McpDispatcher::new(registry, Implementation::new("test-server", "1.0.0"))
    }

    async fn call(dispatcher: &McpDispatcher, payload: Value) -> Value {
        let raw = serde_json::to_vec(&payload).unwrap();
        let reply = dispatcher.handle(&raw).await.expect("expected a response");
        serde_json::from_slice(&reply).unwrap()
    }

    #[tokio::test]
    async fn initialize_reports_protocol_and_capabilities() {
        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await;
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["result"]["protocolVersion"], json!("2024-11-05"));
        assert_eq!(
            reply["result"]["capabilities"]["tools"]["listChanged"],
            json!(false)
        );
        assert_eq!(reply["result"]["serverInfo"]["name"], json!("test-server"));
    }

    #[tokio::test]
    async fn fractional_and_large_ids_are_echoed() {
        let reply = call(&dispatcher(), json!({"jsonrpc": "2.0", "id": 1.5, "method": "ping"})).await;
        assert_eq!(reply["id"], json!(1.5));
        assert_eq!(reply["result"], json!({}));
        assert!(reply.get("error").is_none());

        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": u64::MAX, "method": "ping"}),
        )
        .await;
        assert_eq!(reply["id"], json!(u64::MAX));

        let reply = call(&dispatcher(), json!({"jsonrpc": "2.0", "id": -3, "method": "nope"})).await;
        assert_eq!(reply["id"], json!(-3));
        assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error_without_id() {
        let reply = dispatcher().handle(b"{not json").await.unwrap();
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["error"]["code"], json!(PARSE_ERROR));
        assert!(reply.get("id").is_none());
    }

    #[tokio::test]
    async fn missing_method_is_a_parse_error() {
        let reply = call(&dispatcher(), json!({"jsonrpc": "2.0", "id": 4})).await;
        assert_eq!(reply["error"]["code"], json!(PARSE_ERROR));
    }

    #[tokio::test]
    async fn unknown_method_echoes_id() {
        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": "abc", "method": "resources/list"}),
        )
        .await;
        assert_eq!(reply["id"], json!("abc"));
        assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));
        assert!(reply.get("result").is_none());
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let dispatcher = dispatcher();
        let raw = br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert!(dispatcher.handle(raw).await.is_none());
        let raw = br#"{"jsonrpc":"2.0","method":"no/such/method"}"#;
        assert!(dispatcher.handle(raw).await.is_none());
    }

    #[tokio::test]
    async fn tools_list_returns_definitions_in_order() {
        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await;
        let tools = reply["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], json!("shout"));
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["text"]));
        assert_eq!(tools[1]["name"], json!("echo"));
    }

    #[tokio::test]
    async fn tools_call_returns_text_content() {
        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                   "params": {"name": "echo", "arguments": {}}}),
        )
        .await;
        assert_eq!(reply["result"]["content"][0]["type"], json!("text"));
        assert_eq!(reply["result"]["content"][0]["text"], json!("X"));
        assert_eq!(reply["result"]["isError"], json!(false));
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call",
                   "params": {"name": "nope", "arguments": {}}}),
        )
        .await;
        assert_eq!(reply["error"]["code"], json!(INVALID_PARAMS));
        assert_eq!(reply["error"]["message"], json!("Tool not found: nope"));
    }

    #[tokio::test]
    async fn missing_name_or_arguments_is_invalid_params() {
        let dispatcher = dispatcher();
        for params in [json!({"arguments": {}}), json!({"name": "echo"}), json!("echo")] {
            let reply = call(
                &dispatcher,
                json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call", "params": params}),
            )
            .await;
            assert_eq!(reply["error"]["code"], json!(INVALID_PARAMS), "{params}");
        }
    }

    #[tokio::test]
    async fn schema_violations_are_invalid_params() {
        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call",
                   "params": {"name": "shout", "arguments": {"text": 42}}}),
        )
        .await;
        assert_eq!(reply["error"]["code"], json!(INVALID_PARAMS));

        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": 8, "method": "tools/call",
                   "params": {"name": "shout", "arguments": {}}}),
        )
        .await;
        assert_eq!(reply["error"]["code"], json!(INVALID_PARAMS));
    }

    #[tokio::test]
    async fn tool_errors_and_panics_become_execution_errors() {
        let dispatcher = dispatcher();
        for text in ["fail", "panic"] {
            let reply = call(
                &dispatcher,
                json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call",
                       "params": {"name": "shout", "arguments": {"text": text}}}),
            )
            .await;
            assert_eq!(reply["error"]["code"], json!(TOOL_EXECUTION_ERROR), "{text}");
            assert_eq!(reply["id"], json!(9));
        }
    }

    #[tokio::test]
    async fn handled_failure_sets_is_error() {
        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "2.0", "id": 10, "method": "tools/call",
                   "params": {"name": "shout", "arguments": {"text": "soft"}}}),
        )
        .await;
        assert_eq!(reply["result"]["isError"], json!(true));
        assert_eq!(reply["result"]["content"][0]["text"], json!("nothing to shout"));
    }

    #[tokio::test]
    async fn lenient_about_jsonrpc_version() {
        let reply = call(
            &dispatcher(),
            json!({"jsonrpc": "1.0", "id": 11, "method": "ping"}),
        )
        .await;
        assert_eq!(reply["result"], json!({}));
    }
}
