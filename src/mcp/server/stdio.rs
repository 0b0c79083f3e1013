use crate::mcp::dispatcher::McpDispatcher;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// Serves newline-delimited JSON-RPC: one request per input line, one
/// response per output line. Notifications produce no output.
pub async fn serve_lines<R, W>(dispatcher: &McpDispatcher, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!(bytes = line.len(), "stdio request");
        if let Some(reply) = dispatcher.handle(line.as_bytes()).await {
            writer.write_all(&reply).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }
    Ok(())
}

pub async fn serve_stdio(dispatcher: &McpDispatcher) -> std::io::Result<()> {
    info!("serving tools over stdio");
    let reader = BufReader::new(tokio::io::stdin());
    serve_lines(dispatcher, reader, tokio::io::stdout()).await?;
    info!("stdin closed; stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::Implementation;
    use crate::mcp::registry::tests::StaticTool;
    use crate::mcp::registry::ToolRegistry;
    use serde_json::Value;
    use std::sync::Arc;

    #[tokio::test]
    async fn answers_each_request_line() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(StaticTool::new("echo", "X"));
        let dispatcher = McpDispatcher::new(registry, Implementation::new("stdio", "0.1.0"));

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{}}}"#,
            "\n",
        );
        let mut output = Vec::new();
        serve_lines(&dispatcher, input.as_bytes(), &mut output)
            .await
            .unwrap();

        let replies: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[0]["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(replies[1]["result"]["content"][0]["text"], "X");
    }
}
