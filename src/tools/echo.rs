use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::mcp::registry::{PropertySchema, Tool, ToolDescriptor, ToolError, ToolOutput};

pub const TOOL_NAME: &str = "echo";

/// Returns its `message` argument unchanged.
pub struct EchoTool {
    descriptor: ToolDescriptor,
}

impl EchoTool {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new(TOOL_NAME, "Echo the given message back.")
                .with_required_property(
                    "message",
                    PropertySchema::string().with_description("Text to echo"),
                )
                .with_example("Repeat after me: hello", json!({"message": "hello"})),
        }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let message = arguments
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_argument("message", "expected a string"))?;
        Ok(ToolOutput::text(message))
    }
}
