//! Tool catalogue served by the dispatcher.
//!
//! Tools are stored in registration order. Registering a name that already
//! exists replaces the earlier tool in place and logs a warning.

use crate::mcp::protocol::{
    CallToolResult, FewShotExample, NegativeExample, ToolDefinition, ToolResultContent,
};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Execution(String),
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        ToolError::Execution(message.into())
    }

    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertySchema {
    pub kind: String,
    pub description: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub default: Option<Value>,
}

impl PropertySchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: None,
            enum_values: None,
            default: None,
        }
    }

    pub fn string() -> Self {
        Self::new("string")
    }

    pub fn integer() -> Self {
        Self::new("integer")
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_enum<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn to_json(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(description) = &self.description {
            schema.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
        if let Some(values) = &self.enum_values {
            schema.insert("enum".to_string(), json!(values));
        }
        if let Some(default) = &self.default {
            schema.insert("default".to_string(), default.clone());
        }
        Value::Object(schema)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSchema {
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
    pub description: Option<String>,
}

impl InputSchema {
    pub fn to_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|(name, property)| (name.clone(), property.to_json()))
            .collect();
        let mut schema = Map::new();
        schema.insert("type".to_string(), Value::String("object".to_string()));
        schema.insert("properties".to_string(), Value::Object(properties));
        if !self.required.is_empty() {
            schema.insert("required".to_string(), json!(self.required));
        }
        if let Some(description) = &self.description {
            schema.insert("description".to_string(), Value::String(description.clone()));
        }
        Value::Object(schema)
    }
}

/// Static description of a tool: its name, what it does, its argument
/// schema and the examples shown to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    pub few_shot_examples: Vec<FewShotExample>,
    pub negative_examples: Vec<NegativeExample>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::default(),
            few_shot_examples: Vec::new(),
            negative_examples: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, property: PropertySchema) -> Self {
        self.input_schema.properties.insert(name.into(), property);
        self
    }

    pub fn with_required_property(
        mut self,
        name: impl Into<String>,
        property: PropertySchema,
    ) -> Self {
        let name = name.into();
        self.input_schema.required.push(name.clone());
        self.input_schema.properties.insert(name, property);
        self
    }

    /// Describes the arguments object as a whole.
    pub fn with_schema_description(mut self, description: impl Into<String>) -> Self {
        self.input_schema.description = Some(description.into());
        self
    }

    pub fn with_example(mut self, request: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.few_shot_examples.push(FewShotExample {
            request: request.into(),
            params,
        });
        self
    }

    pub fn with_negative_example(
        mut self,
        request: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        self.negative_examples.push(NegativeExample {
            request: request.into(),
            reason: reason.into(),
        });
        self
    }

    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.to_json(),
            few_shot_examples: (!self.few_shot_examples.is_empty())
                .then(|| self.few_shot_examples.clone()),
            negative_examples: (!self.negative_examples.is_empty())
                .then(|| self.negative_examples.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text(String),
    Json(Value),
}

/// What a tool produced. `Failure` is a handled, user-facing error and is
/// reported with `isError=true` rather than as a protocol error.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Success(Vec<ToolContent>),
    Failure(String),
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutput::Success(vec![ToolContent::Text(text.into())])
    }

    pub fn json(value: Value) -> Self {
        ToolOutput::Success(vec![ToolContent::Json(value)])
    }

    pub fn failure(message: impl Into<String>) -> Self {
        ToolOutput::Failure(message.into())
    }
}

impl From<ToolOutput> for CallToolResult {
    fn from(output: ToolOutput) -> Self {
        match output {
            ToolOutput::Success(content) => CallToolResult::success(
                content
                    .into_iter()
                    .map(|block| match block {
                        ToolContent::Text(text) => ToolResultContent::text(text),
                        ToolContent::Json(value) => ToolResultContent::json(value),
                    })
                    .collect(),
            ),
            ToolOutput::Failure(message) => CallToolResult::error(message),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

/// A bundle of tools registered together.
pub trait ToolPlugin {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        match tools.iter_mut().find(|existing| existing.name() == name) {
            Some(slot) => {
                warn!(tool = %name, "tool already registered; replacing");
                *slot = tool;
            }
            None => {
                info!(tool = %name, "registered tool");
                tools.push(tool);
            }
        }
    }

    pub fn register_plugin(&self, plugin: &dyn ToolPlugin) {
        let tools = plugin.tools();
        info!(
            plugin = plugin.name(),
            version = plugin.version(),
            tools = tools.len(),
            "registering plugin"
        );
        for tool in tools {
            self.register(tool);
        }
    }

    /// Removes the named tool. Returns whether anything was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let before = tools.len();
        tools.retain(|tool| tool.name() != name);
        let removed = tools.len() != before;
        if removed {
            info!(tool = %name, "unregistered tool");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|tool| tool.name() == name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Definitions of every registered tool, in registration order.
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|tool| tool.descriptor().to_definition())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let count = tools.len();
        tools.clear();
        info!(count, "cleared tool registry");
    }
}
