//! The tool-calling loop: ask the model, run the tool it picks, feed the
//! result back, and stop on a plain answer or after [`MAX_TOOL_ITERATIONS`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::api::{ChatMessage, ChatToolCall, ChatToolCallFunction, ChatToolDefinition, ChatToolFunction};
use crate::core::chat_client::ModelError;
use crate::core::message::{Conversation, ConversationTurn, ToolCall, TranscriptRole};
use crate::core::sanitize::{find_image, history_window, sanitize_for_model, SanitizeLimits};
use crate::mcp::protocol::ToolDefinition;
use crate::mcp::transport::TransportError;

pub const MAX_TOOL_ITERATIONS: usize = 10;

pub fn chain_limit_message() -> String {
    format!("Error: Too many function calls in chain (max {MAX_TOOL_ITERATIONS})")
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Answer(String),
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub reply: ModelReply,
    pub usage: Option<TokenUsage>,
}

impl From<ModelReply> for ModelResponse {
    fn from(reply: ModelReply) -> Self {
        Self { reply, usage: None }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ChatToolDefinition],
    ) -> Result<ModelResponse, ModelError>;
}

/// How a tool invocation ended when the tool could be reached at all.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed(String),
    /// The tool ran (or was rejected) and reported an error; the loop goes on.
    Failed(String),
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn available_tools(&self) -> Vec<ToolDefinition>;

    /// `Err` means the tool could not be reached; it ends the loop.
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Answered(String),
    OrchestrationLimit,
    TransportFailed(String),
    ModelFailed(String),
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    /// Number of model round trips
    pub iterations: usize,
    /// Turns appended to the conversation, starting with the user turn
    pub turns: Vec<ConversationTurn>,
    pub usage: TokenUsage,
    pub elapsed: Duration,
}

pub struct ToolOrchestrator<M, E> {
    model: M,
    executor: E,
    limits: SanitizeLimits,
}

impl<M: ChatModel, E: ToolExecutor> ToolOrchestrator<M, E> {
    pub fn new(model: M, executor: E) -> Self {
        Self {
            model,
            executor,
            limits: SanitizeLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SanitizeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Appends `input` and every turn produced while answering it. Every
    /// outcome, including failures, leaves a turn in the conversation.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        input: impl Into<String>,
    ) -> TurnReport {
        let started = Instant::now();
        let first_new = conversation.len();
        conversation.push(ConversationTurn::user(input));

        let tools = self.executor.available_tools().await;
        let declarations = function_declarations(&tools);
        let mut usage = TokenUsage::default();
        let mut iterations = 0;

        let outcome = loop {
            if iterations == MAX_TOOL_ITERATIONS {
                warn!(max = MAX_TOOL_ITERATIONS, "tool chain limit reached");
                conversation.push(ConversationTurn::error(chain_limit_message()));
                break TurnOutcome::OrchestrationLimit;
            }
            iterations += 1;

            let messages = model_messages(conversation, &self.limits);
            debug!(iteration = iterations, messages = messages.len(), "sending conversation to model");
            let response = match self.model.complete(&messages, &declarations).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "model request failed");
                    let message = err.to_string();
                    conversation.push(ConversationTurn::error(format!("Error: {message}")));
                    break TurnOutcome::ModelFailed(message);
                }
            };
            if let Some(step) = response.usage {
                usage.add(step);
            }

            let call = match response.reply {
                ModelReply::Answer(text) => {
                    let text = text.trim().to_string();
                    conversation.push(ConversationTurn::assistant(text.clone()));
                    break TurnOutcome::Answered(text);
                }
                ModelReply::ToolCall(call) => call,
            };

            info!(iteration = iterations, tool = %call.name, "model requested tool");
            conversation.push(ConversationTurn::tool_call(call.clone()));
            match self.executor.execute(&call).await {
                Ok(ToolOutcome::Completed(content)) => {
                    let image = find_image(&content, &self.limits).map(|image| image.data);
                    conversation
                        .push(ConversationTurn::tool_result(&call, content, false).with_image(image));
                }
                Ok(ToolOutcome::Failed(message)) => {
                    debug!(tool = %call.name, error = %message, "tool reported failure");
                    conversation.push(ConversationTurn::tool_result(&call, message, true));
                }
                Err(err) => {
                    warn!(tool = %call.name, error = %err, "tool transport failed");
                    let message = err.to_string();
                    conversation.push(ConversationTurn::error(format!("Error: {message}")));
                    break TurnOutcome::TransportFailed(message);
                }
            }
        };

        TurnReport {
            outcome,
            iterations,
            turns: conversation.turns()[first_new..].to_vec(),
            usage,
            elapsed: started.elapsed(),
        }
    }
}

/// Converts tool definitions into function declarations, folding few-shot and
/// negative examples into the description.
pub fn function_declarations(tools: &[ToolDefinition]) -> Vec<ChatToolDefinition> {
    tools
        .iter()
        .map(|tool| ChatToolDefinition {
            kind: "function".to_string(),
            function: ChatToolFunction {
                name: tool.name.clone(),
                description: Some(describe_tool(tool)),
                parameters: tool.input_schema.clone(),
            },
        })
        .collect()
}

fn describe_tool(tool: &ToolDefinition) -> String {
    let mut description = tool.description.clone();
    if let Some(examples) = tool.few_shot_examples.as_deref().filter(|e| !e.is_empty()) {
        description.push_str("\n\nExamples:");
        for example in examples {
            let params = Value::Object(example.params.clone());
            description.push_str(&format!("\n- \"{}\" → {params}", example.request));
        }
    }
    if let Some(examples) = tool.negative_examples.as_deref().filter(|e| !e.is_empty()) {
        description.push_str("\n\nDo NOT use this tool for:");
        for example in examples {
            description.push_str(&format!("\n- \"{}\" → {}", example.request, example.reason));
        }
    }
    description
}

/// The history as the model sees it: sanitized, trimmed to the history
/// budget, system prompt first.
pub fn model_messages(conversation: &Conversation, limits: &SanitizeLimits) -> Vec<ChatMessage> {
    let messages: Vec<ChatMessage> = conversation
        .turns()
        .iter()
        .filter_map(|turn| to_chat_message(turn, limits))
        .collect();

    let lengths: Vec<usize> = messages.iter().map(message_len).collect();
    let start = history_window(&lengths, limits.max_history_chars);
    let kept = messages[start..]
        .iter()
        .skip_while(|message| message.role == "tool")
        .cloned();

    conversation
        .system_prompt
        .as_ref()
        .map(|prompt| ChatMessage::new("system", prompt.clone()))
        .into_iter()
        .chain(kept)
        .collect()
}

fn message_len(message: &ChatMessage) -> usize {
    let calls = message.tool_calls.as_ref().map_or(0, |calls| {
        calls
            .iter()
            .map(|call| call.function.arguments.len())
            .sum::<usize>()
    });
    message.content.len() + calls
}

fn to_chat_message(turn: &ConversationTurn, limits: &SanitizeLimits) -> Option<ChatMessage> {
    let role = turn.role.to_api_role()?;
    let message = match turn.role {
        TranscriptRole::ToolCall => {
            let call = turn.tool_call.as_ref()?;
            ChatMessage {
                tool_calls: Some(vec![ChatToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: call.name.clone(),
                        arguments: Value::Object(call.arguments.clone()).to_string(),
                    },
                }]),
                ..ChatMessage::new(role, "")
            }
        }
        TranscriptRole::ToolResult => {
            let content = json!({
                "result": sanitize_for_model(&turn.content, limits),
                "is_error": turn.is_error,
            });
            ChatMessage {
                name: turn.tool_name().map(str::to_string),
                tool_call_id: turn.tool_call.as_ref().map(|call| call.id.clone()),
                ..ChatMessage::new(role, content.to_string())
            }
        }
        _ => ChatMessage::new(role, sanitize_for_model(&turn.content, limits).into_owned()),
    };
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sanitize::SCREENSHOT_PLACEHOLDER;
    use crate::mcp::protocol::{FewShotExample, NegativeExample};
    use serde_json::Map;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        script: Mutex<VecDeque<Result<ModelReply, String>>>,
        fallback: Option<ModelReply>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<ModelReply, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn always(reply: ModelReply) -> Self {
            Self {
                fallback: Some(reply),
                ..Self::new(Vec::new())
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn last_seen(&self) -> Vec<ChatMessage> {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[ChatToolDefinition],
        ) -> Result<ModelResponse, ModelError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(reply)) => Ok(ModelResponse {
                    reply,
                    usage: Some(TokenUsage {
                        prompt_tokens: 2,
                        completion_tokens: 1,
                        total_tokens: 3,
                    }),
                }),
                Some(Err(message)) => Err(ModelError::Api(message)),
                None => Ok(self.fallback.clone().expect("script exhausted").into()),
            }
        }
    }

    struct RecordingExecutor {
        outcome: ToolOutcome,
        unreachable: bool,
        executed: Mutex<Vec<String>>,
    }

    impl RecordingExecutor {
        fn returning(outcome: ToolOutcome) -> Self {
            Self {
                outcome,
                unreachable: false,
                executed: Mutex::new(Vec::new()),
            }
        }

        fn count(&self) -> usize {
            self.executed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn available_tools(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }

        async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, TransportError> {
            self.executed.lock().unwrap().push(call.name.clone());
            if self.unreachable {
                return Err(TransportError::SessionExpired);
            }
            Ok(self.outcome.clone())
        }
    }

    fn echo_call() -> ModelReply {
        ModelReply::ToolCall(ToolCall::new("call_1", "echo", Map::new()))
    }

    #[tokio::test]
    async fn plain_answer_ends_after_one_round() {
        let orchestrator = ToolOrchestrator::new(
            ScriptedModel::new(vec![Ok(ModelReply::Answer(" Hello ".to_string()))]),
            RecordingExecutor::returning(ToolOutcome::Completed("X".to_string())),
        );
        let mut conversation = Conversation::new().with_system_prompt(Some("Be brief.".to_string()));
        let report = orchestrator.run_turn(&mut conversation, "hi").await;

        assert_eq!(report.outcome, TurnOutcome::Answered("Hello".to_string()));
        assert_eq!(report.iterations, 1);
        assert_eq!(report.turns.len(), 2);
        assert_eq!(report.usage.total_tokens, 3);
        assert_eq!(orchestrator.executor().count(), 0);

        let seen = orchestrator.model.last_seen();
        assert_eq!(seen[0].role, "system");
        assert_eq!(seen[1].content, "hi");
    }

    #[tokio::test]
    async fn tool_result_is_fed_back_as_wrapped_json() {
        let orchestrator = ToolOrchestrator::new(
            ScriptedModel::new(vec![Ok(echo_call()), Ok(ModelReply::Answer("done".to_string()))]),
            RecordingExecutor::returning(ToolOutcome::Completed("X".to_string())),
        );
        let mut conversation = Conversation::new();
        let report = orchestrator.run_turn(&mut conversation, "echo please").await;

        assert_eq!(report.outcome, TurnOutcome::Answered("done".to_string()));
        assert_eq!(report.iterations, 2);
        let roles: Vec<_> = conversation.turns().iter().map(|turn| turn.role).collect();
        assert_eq!(
            roles,
            vec![
                TranscriptRole::User,
                TranscriptRole::ToolCall,
                TranscriptRole::ToolResult,
                TranscriptRole::Assistant
            ]
        );

        let seen = orchestrator.model.last_seen();
        assert_eq!(seen[1].tool_calls.as_ref().unwrap()[0].function.name, "echo");
        assert_eq!(seen[2].role, "tool");
        assert_eq!(seen[2].tool_call_id.as_deref(), Some("call_1"));
        let payload: Value = serde_json::from_str(&seen[2].content).unwrap();
        assert_eq!(payload, json!({"result": "X", "is_error": false}));
    }

    #[tokio::test]
    async fn endless_tool_calls_stop_after_exactly_ten_rounds() {
        let orchestrator = ToolOrchestrator::new(
            ScriptedModel::always(echo_call()),
            RecordingExecutor::returning(ToolOutcome::Completed("again".to_string())),
        );
        let mut conversation = Conversation::new();
        let report = orchestrator.run_turn(&mut conversation, "loop").await;

        assert_eq!(report.outcome, TurnOutcome::OrchestrationLimit);
        assert_eq!(report.iterations, MAX_TOOL_ITERATIONS);
        assert_eq!(orchestrator.model.calls(), 10);
        assert_eq!(orchestrator.executor().count(), 10);
        let last = conversation.last().unwrap();
        assert_eq!(last.role, TranscriptRole::AppError);
        assert_eq!(last.content, "Error: Too many function calls in chain (max 10)");
    }

    #[tokio::test]
    async fn tool_failure_continues_the_loop() {
        let orchestrator = ToolOrchestrator::new(
            ScriptedModel::new(vec![Ok(echo_call()), Ok(ModelReply::Answer("sorry".to_string()))]),
            RecordingExecutor::returning(ToolOutcome::Failed("city not found".to_string())),
        );
        let mut conversation = Conversation::new();
        let report = orchestrator.run_turn(&mut conversation, "weather?").await;

        assert_eq!(report.outcome, TurnOutcome::Answered("sorry".to_string()));
        let result = &conversation.turns()[2];
        assert!(result.is_error);
        let payload: Value =
            serde_json::from_str(&orchestrator.model.last_seen()[2].content).unwrap();
        assert_eq!(payload["is_error"], true);
    }

    #[tokio::test]
    async fn transport_failure_aborts_with_error_turn() {
        let orchestrator = ToolOrchestrator::new(
            ScriptedModel::always(echo_call()),
            RecordingExecutor {
                unreachable: true,
                ..RecordingExecutor::returning(ToolOutcome::Completed("X".to_string()))
            },
        );
        let mut conversation = Conversation::new();
        let report = orchestrator.run_turn(&mut conversation, "go").await;

        assert!(matches!(report.outcome, TurnOutcome::TransportFailed(_)));
        assert_eq!(orchestrator.model.calls(), 1);
        assert_eq!(conversation.last().unwrap().role, TranscriptRole::AppError);
    }

    #[tokio::test]
    async fn model_failure_is_recorded_as_error_turn() {
        let orchestrator = ToolOrchestrator::new(
            ScriptedModel::new(vec![Err("API Error: overloaded".to_string())]),
            RecordingExecutor::returning(ToolOutcome::Completed("X".to_string())),
        );
        let mut conversation = Conversation::new();
        let report = orchestrator.run_turn(&mut conversation, "hi").await;

        assert_eq!(
            report.outcome,
            TurnOutcome::ModelFailed("API Error: overloaded".to_string())
        );
        assert_eq!(conversation.last().unwrap().content, "Error: API Error: overloaded");
    }

    #[tokio::test]
    async fn screenshots_are_kept_locally_and_replaced_for_the_model() {
        let screenshot: String = "iVBORw0K".chars().cycle().take(4_000).collect();
        let content = json!({"screenshot": screenshot}).to_string();
        let orchestrator = ToolOrchestrator::new(
            ScriptedModel::new(vec![Ok(echo_call()), Ok(ModelReply::Answer("ok".to_string()))]),
            RecordingExecutor::returning(ToolOutcome::Completed(content.clone())),
        );
        let mut conversation = Conversation::new();
        orchestrator.run_turn(&mut conversation, "snap").await;

        let result = &conversation.turns()[2];
        assert_eq!(result.content, content);
        assert_eq!(result.image.as_deref(), Some(screenshot.as_str()));
        let payload: Value =
            serde_json::from_str(&orchestrator.model.last_seen()[2].content).unwrap();
        assert_eq!(payload["result"], SCREENSHOT_PLACEHOLDER);
    }

    #[test]
    fn declarations_fold_examples_into_description() {
        let mut params = Map::new();
        params.insert("city".to_string(), json!("Oslo"));
        let tool = ToolDefinition {
            name: "weather_forecast".to_string(),
            description: "Weather lookup".to_string(),
            input_schema: json!({"type": "object"}),
            few_shot_examples: Some(vec![FewShotExample {
                request: "Weather in Oslo?".to_string(),
                params,
            }]),
            negative_examples: Some(vec![NegativeExample {
                request: "What is a cloud?".to_string(),
                reason: "general knowledge".to_string(),
            }]),
        };
        let declarations = function_declarations(&[tool]);
        assert_eq!(
            declarations[0].function.description.as_deref(),
            Some(
                "Weather lookup\n\nExamples:\n- \"Weather in Oslo?\" → {\"city\":\"Oslo\"}\n\nDo NOT use this tool for:\n- \"What is a cloud?\" → general knowledge"
            )
        );
    }

    #[test]
    fn history_budget_drops_old_turns_and_orphaned_results() {
        let call = ToolCall::new("c1", "echo", Map::new());
        let conversation = Conversation::restore(vec![
            ConversationTurn::user("a".repeat(100)),
            ConversationTurn::tool_call(call.clone()),
            ConversationTurn::tool_result(&call, "b".repeat(30), false),
            ConversationTurn::error("local only"),
            ConversationTurn::assistant("c".repeat(40)),
        ]);
        let limits = SanitizeLimits {
            max_history_chars: 101,
            ..SanitizeLimits::default()
        };
        let messages = model_messages(&conversation, &limits);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "assistant");

        let everything = model_messages(&conversation, &SanitizeLimits::default());
        assert_eq!(everything.len(), 4);
    }
}
