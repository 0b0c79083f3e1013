use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TranscriptRole {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    AppError,
}

impl TranscriptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Assistant => "assistant",
            TranscriptRole::ToolCall => "tool/call",
            TranscriptRole::ToolResult => "tool/result",
            TranscriptRole::AppError => "app/error",
        }
    }

    /// Role used when the turn is sent to the model; app errors stay local.
    pub fn to_api_role(self) -> Option<&'static str> {
        match self {
            TranscriptRole::User => Some("user"),
            TranscriptRole::Assistant | TranscriptRole::ToolCall => Some("assistant"),
            TranscriptRole::ToolResult => Some("tool"),
            TranscriptRole::AppError => None,
        }
    }
}

impl AsRef<str> for TranscriptRole {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for TranscriptRole {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "user" => Ok(TranscriptRole::User),
            "assistant" => Ok(TranscriptRole::Assistant),
            "tool/call" => Ok(TranscriptRole::ToolCall),
            "tool/result" => Ok(TranscriptRole::ToolResult),
            "app/error" => Ok(TranscriptRole::AppError),
            _ => Err(format!("invalid transcript role: {value}")),
        }
    }
}

impl TryFrom<String> for TranscriptRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        Self::try_from(value.as_str())
    }
}

impl From<TranscriptRole> for String {
    fn from(value: TranscriptRole) -> Self {
        value.as_str().to_string()
    }
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One entry of the conversation history.
///
/// `content` is always the full original text; the copy sent to the model is
/// produced separately by sanitization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TranscriptRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// Base64 image found in a tool result, kept for display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    fn new(role: TranscriptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call: None,
            is_error: false,
            image: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TranscriptRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TranscriptRole::Assistant, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(TranscriptRole::AppError, content)
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        let content = Value::Object(call.arguments.clone()).to_string();
        Self {
            tool_call: Some(call),
            ..Self::new(TranscriptRole::ToolCall, content)
        }
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call: Some(call.clone()),
            is_error,
            ..Self::new(TranscriptRole::ToolResult, content)
        }
    }

    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.tool_call.as_ref().map(|call| call.name.as_str())
    }

    /// Decoded bytes of the preserved image, if it is valid base64.
    pub fn image_bytes(&self) -> Option<Vec<u8>> {
        let image = self.image.as_deref()?;
        let payload = image
            .split_once(";base64,")
            .map_or(image, |(_, payload)| payload);
        BASE64_STANDARD.decode(payload.trim()).ok()
    }
}

/// Ordered history of one conversation plus its optional system prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|prompt| !prompt.trim().is_empty());
        self
    }

    /// Rebuilds a conversation from previously persisted turns.
    pub fn restore(turns: Vec<ConversationTurn>) -> Self {
        Self {
            system_prompt: None,
            turns,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_round_trip_through_strings() {
        for role in [
            TranscriptRole::User,
            TranscriptRole::Assistant,
            TranscriptRole::ToolCall,
            TranscriptRole::ToolResult,
            TranscriptRole::AppError,
        ] {
            assert_eq!(TranscriptRole::try_from(role.as_str()), Ok(role));
        }
        assert!(TranscriptRole::try_from("system").is_err());
    }

    #[test]
    fn turns_serialize_for_persistence() {
        let mut arguments = Map::new();
        arguments.insert("city".to_string(), json!("Oslo"));
        let call = ToolCall::new("call_1", "weather_forecast", arguments);
        let turn = ConversationTurn::tool_result(&call, "sunny", false);

        let encoded = serde_json::to_value(&turn).unwrap();
        assert_eq!(encoded["role"], "tool/result");
        assert!(encoded.get("is_error").is_none());
        assert!(encoded.get("image").is_none());

        let decoded: ConversationTurn = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, turn);
        assert_eq!(decoded.tool_name(), Some("weather_forecast"));
    }

    #[test]
    fn tool_call_turn_shows_arguments() {
        let mut arguments = Map::new();
        arguments.insert("n".to_string(), json!(1));
        let turn = ConversationTurn::tool_call(ToolCall::new("c", "count", arguments));
        assert_eq!(turn.content, r#"{"n":1}"#);
        assert_eq!(turn.role.to_api_role(), Some("assistant"));
    }

    #[test]
    fn image_bytes_accepts_plain_and_data_url_payloads() {
        let turn = ConversationTurn::assistant("x").with_image(Some("aGVsbG8=".to_string()));
        assert_eq!(turn.image_bytes().as_deref(), Some(&b"hello"[..]));

        let turn = ConversationTurn::assistant("x")
            .with_image(Some("data:image/png;base64,aGVsbG8=".to_string()));
        assert_eq!(turn.image_bytes().as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn restore_keeps_order() {
        let conversation = Conversation::restore(vec![
            ConversationTurn::user("a"),
            ConversationTurn::assistant("b"),
        ]);
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.last().unwrap().content, "b");
    }
}
