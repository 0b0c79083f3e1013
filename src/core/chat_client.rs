//! Non-streaming OpenAI-compatible `chat/completions` client with function
//! calling.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::api::{ChatCompletionResponse, ChatMessage, ChatRequest, ChatToolDefinition};
use crate::core::config::data::ModelConfig;
use crate::core::message::ToolCall;
use crate::core::orchestrator::{ChatModel, ModelReply, ModelResponse, TokenUsage};
use crate::utils::url::construct_api_url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Api(String),
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("model returned no choices")]
    EmptyResponse,
    #[error("invalid arguments for `{name}`: {reason}")]
    InvalidArguments { name: String, reason: String },
    #[error("no API key: set the {0} environment variable")]
    MissingApiKey(String),
}

pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiChatModel {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ModelError::MissingApiKey(config.api_key_env().to_string()))?;
        Self::new(config.base_url(), config.model(), api_key)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ChatToolDefinition],
    ) -> Result<ModelResponse, ModelError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: false,
            tools: (!tools.is_empty()).then(|| tools.to_vec()),
        };
        let url = construct_api_url(&self.base_url, "chat/completions");
        debug!(model = %self.model, messages = messages.len(), tools = tools.len(), "requesting completion");

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ModelError::Api(format_api_error(&body)));
        }
        parse_completion(&body)
    }
}

pub(crate) fn parse_completion(body: &str) -> Result<ModelResponse, ModelError> {
    let value: Value = serde_json::from_str(body)?;
    let usage = value.get("usage").map(|usage| TokenUsage {
        prompt_tokens: usage_field(usage, "prompt_tokens"),
        completion_tokens: usage_field(usage, "completion_tokens"),
        total_tokens: usage_field(usage, "total_tokens"),
    });
    if value.get("error").is_some() {
        return Err(ModelError::Api(format_api_error(body)));
    }

    let completion: ChatCompletionResponse = serde_json::from_value(value)?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(ModelError::EmptyResponse)?;

    let reply = match choice
        .message
        .tool_calls
        .and_then(|calls| calls.into_iter().next())
    {
        Some(call) => {
            let arguments = parse_arguments(&call.function.name, &call.function.arguments)?;
            ModelReply::ToolCall(ToolCall::new(call.id, call.function.name, arguments))
        }
        None => ModelReply::Answer(choice.message.content.unwrap_or_default()),
    };
    Ok(ModelResponse { reply, usage })
}

fn usage_field(usage: &Value, key: &str) -> u64 {
    usage.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn parse_arguments(name: &str, raw: &str) -> Result<Map<String, Value>, ModelError> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(arguments)) => Ok(arguments),
        Ok(other) => Err(ModelError::InvalidArguments {
            name: name.to_string(),
            reason: format!("expected an object, got {other}"),
        }),
        Err(err) => Err(ModelError::InvalidArguments {
            name: name.to_string(),
            reason: err.to_string(),
        }),
    }
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|error| match error {
                Value::String(text) => Some(text.clone()),
                _ => None,
            })
        })
        .or_else(|| value.get("message").and_then(Value::as_str).map(str::to_owned));

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API Error: <empty>".to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value).filter(|text| !text.is_empty()) {
            return format!("API Error: {summary}");
        }
        return format!("API Error: {value}");
    }
    format!("API Error: {trimmed}")
}
