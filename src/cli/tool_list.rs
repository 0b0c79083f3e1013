use std::error::Error;

use crate::core::config::data::Config;
use crate::mcp::client::{ConnectionStatus, McpClientManager, McpServerState};

pub async fn list_tools(config: &Config) -> Result<(), Box<dyn Error>> {
    let mut manager = McpClientManager::from_config(config);
    if manager.servers().next().is_none() {
        println!("No tool servers configured. Add an [[mcp_servers]] entry to your config.");
        return Ok(());
    }

    manager.connect_all().await;
    for server in manager.servers() {
        print!("{}", render_server(server));
    }
    manager.disconnect_all().await;
    Ok(())
}

fn render_server(server: &McpServerState) -> String {
    let mut output = format!("{} ({})\n", server.config.display_name(), server.id());
    match server.status {
        ConnectionStatus::Connected if server.tools.is_empty() => {
            output.push_str("  ✅ connected, no tools\n");
        }
        ConnectionStatus::Connected => {
            for tool in &server.tools {
                let summary = tool.description.lines().next().unwrap_or_default();
                output.push_str(&format!("  • {} - {summary}\n", tool.name));
            }
        }
        ConnectionStatus::Failed => {
            let error = server.last_error.as_deref().unwrap_or("unknown error");
            output.push_str(&format!("  ❌ {error}\n"));
        }
        ConnectionStatus::Disconnected => output.push_str("  ⏸️  disconnected\n"),
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::data::McpServerConfig;

    #[test]
    fn failed_server_shows_error() {
        let mut state = McpServerState::new(McpServerConfig {
            id: "weather".to_string(),
            ..McpServerConfig::default()
        });
        state.status = ConnectionStatus::Failed;
        state.last_error = Some("connection refused".to_string());
        assert_eq!(render_server(&state), "weather (weather)\n  ❌ connection refused\n");
    }
}
