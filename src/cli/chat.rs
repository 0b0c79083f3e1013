use std::error::Error;
use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tracing::info;

use crate::core::chat_client::OpenAiChatModel;
use crate::core::config::data::Config;
use crate::core::message::{Conversation, ConversationTurn, TranscriptRole};
use crate::core::orchestrator::{ToolOrchestrator, TurnReport};
use crate::core::tool_router::ToolRouter;
use crate::mcp::client::{ConnectionStatus, McpClientManager};

const TOOL_RESULT_PREVIEW_CHARS: usize = 600;

pub async fn run_chat(config: &Config, prompt: Option<String>) -> Result<(), Box<dyn Error>> {
    let model = OpenAiChatModel::from_config(&config.model)?;

    let mut manager = McpClientManager::from_config(config);
    manager.connect_all().await;
    for server in manager.servers() {
        if server.status == ConnectionStatus::Failed {
            eprintln!(
                "⚠️  {}: {}",
                server.config.display_name(),
                server.last_error.as_deref().unwrap_or("connection failed")
            );
        }
    }
    let manager = Arc::new(RwLock::new(manager));
    let orchestrator = ToolOrchestrator::new(model, ToolRouter::new(Arc::clone(&manager)));
    let mut conversation =
        Conversation::new().with_system_prompt(config.model.system_prompt.clone());

    match prompt {
        Some(prompt) => {
            let report = orchestrator.run_turn(&mut conversation, prompt).await;
            print_report(&report);
        }
        None => repl(&orchestrator, &mut conversation, config).await?,
    }

    manager.write().await.disconnect_all().await;
    Ok(())
}

async fn repl(
    orchestrator: &ToolOrchestrator<OpenAiChatModel, ToolRouter>,
    conversation: &mut Conversation,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    println!(
        "💬 Chatting with {} ({} tools). /refresh reloads tools, /clear resets, /quit exits.",
        config.model.model(),
        orchestrator.executor().manager().read().await.tools().len()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/refresh" => {
                let mut manager = orchestrator.executor().manager().write().await;
                let ids: Vec<String> = manager
                    .servers()
                    .filter(|server| server.is_connected())
                    .map(|server| server.id().to_string())
                    .collect();
                for id in ids {
                    if let Err(err) = manager.refresh_tools(&id).await {
                        eprintln!("⚠️  {id}: {err}");
                    }
                }
                println!("🔄 {} remote tools available", manager.tools().len());
            }
            "/clear" => {
                conversation.clear();
                println!("🧹 Conversation cleared");
            }
            input => {
                let report = orchestrator.run_turn(conversation, input).await;
                print_report(&report);
            }
        }
    }
    Ok(())
}

fn print_report(report: &TurnReport) {
    for turn in &report.turns {
        if let Some(rendered) = render_turn(turn) {
            println!("{rendered}");
        }
    }
    info!(
        iterations = report.iterations,
        total_tokens = report.usage.total_tokens,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "turn finished"
    );
}

/// Text shown to the user for one turn; user turns are not echoed.
pub fn render_turn(turn: &ConversationTurn) -> Option<String> {
    let rendered = match turn.role {
        TranscriptRole::User => return None,
        TranscriptRole::Assistant => turn.content.clone(),
        TranscriptRole::ToolCall => {
            format!("🔧 {}({})", turn.tool_name().unwrap_or("?"), turn.content)
        }
        TranscriptRole::ToolResult => {
            let marker = if turn.is_error { "❌" } else { "📦" };
            match turn.image_bytes() {
                Some(bytes) => format!("{marker} 🖼️  image received ({} bytes)", bytes.len()),
                None => format!("{marker} {}", preview(&turn.content, TOOL_RESULT_PREVIEW_CHARS)),
            }
        }
        TranscriptRole::AppError => format!("❌ {}", turn.content),
    };
    Some(rendered)
}

fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim_end();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut short: String = text.chars().take(max_chars).collect();
    short.push('…');
    short
}
