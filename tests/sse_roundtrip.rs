mod common;

use std::time::Duration;

use serde_json::{json, Map, Value};

use toolweave::mcp::client::{McpClient, McpClientError};
use toolweave::mcp::protocol::PROTOCOL_VERSION;
use toolweave::mcp::transport::{SseTransport, Transport, TransportError};

fn message(text: &str) -> Map<String, Value> {
    let mut arguments = Map::new();
    arguments.insert("message".to_string(), json!(text));
    arguments
}

fn session_id(endpoint: &str) -> String {
    endpoint
        .split("sessionId=")
        .nth(1)
        .map(str::to_string)
        .unwrap_or_else(|| panic!("endpoint without session id: {endpoint}"))
}

#[tokio::test]
async fn client_initializes_lists_and_calls_tools() {
    let server = common::spawn_server(None).await;
    let client = McpClient::new(SseTransport::new(&server.base_url()).unwrap());

    let details = client.connect().await.unwrap();
    assert_eq!(details.protocol_version, PROTOCOL_VERSION);
    assert_eq!(details.server_info.name, "test-server");

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].input_schema["required"], json!(["message"]));

    let result = client.call_tool("echo", message("over the wire")).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content[0].as_text(), "over the wire");

    client.close().await;
    assert!(!client.transport().is_active());
}

#[tokio::test]
async fn base_url_with_sse_suffix_is_accepted() {
    let server = common::spawn_server(None).await;
    let transport = SseTransport::new(&format!("{}/sse/", server.base_url())).unwrap();
    assert_eq!(transport.base_url(), server.base_url());

    transport.start().await.unwrap();
    let endpoint = transport.endpoint().unwrap();
    assert!(endpoint.starts_with(&format!("{}/message?sessionId=", server.base_url())));
    transport.close().await;
}

#[tokio::test]
async fn failing_tool_call_reports_error_result() {
    let server = common::spawn_server(None).await;
    let client = McpClient::new(SseTransport::new(&server.base_url()).unwrap());
    client.connect().await.unwrap();

    let mut arguments = Map::new();
    arguments.insert("message".to_string(), json!(42));
    let err = client.call_tool("echo", arguments).await.unwrap_err();
    match err {
        McpClientError::Rpc(error) => assert_eq!(error.code, -32602),
        other => panic!("expected an invalid params error, got {other:?}"),
    }

    let err = client.call_tool("missing", Map::new()).await.unwrap_err();
    assert!(matches!(err, McpClientError::Rpc(_)), "got {err:?}");
    client.close().await;
}

#[tokio::test]
async fn evicted_session_is_reestablished_transparently() {
    let server = common::spawn_server(None).await;
    let client = McpClient::new(SseTransport::new(&server.base_url()).unwrap());
    client.connect().await.unwrap();

    let first = client.transport().endpoint().unwrap();
    assert!(server.sessions.remove(&session_id(&first)));

    let result = client.call_tool("echo", message("still here")).await.unwrap();
    assert_eq!(result.content[0].as_text(), "still here");

    let second = client.transport().endpoint().unwrap();
    assert_ne!(session_id(&first), session_id(&second));
    assert!(server.sessions.get(&session_id(&second)).is_some());
    client.close().await;
}

#[tokio::test]
async fn bearer_token_is_required_when_configured() {
    let server = common::spawn_server(Some("s3cret")).await;

    let anonymous = SseTransport::new(&server.base_url())
        .unwrap()
        .with_endpoint_timeout(Duration::from_millis(500));
    let err = anonymous.start().await.unwrap_err();
    assert!(
        matches!(
            err,
            TransportError::StreamClosed | TransportError::EndpointTimeout(_)
        ),
        "got {err:?}"
    );

    let client = McpClient::new(
        SseTransport::new(&server.base_url())
            .unwrap()
            .with_bearer_token("s3cret")
            .unwrap(),
    );
    client.connect().await.unwrap();
    assert_eq!(client.list_tools().await.unwrap().len(), 1);
    client.close().await;
}

#[tokio::test]
async fn streamed_reply_copies_are_not_retained() {
    let server = common::spawn_server(None).await;
    let client = McpClient::new(SseTransport::new(&server.base_url()).unwrap());
    client.connect().await.unwrap();

    for round in 0..50 {
        let text = format!("round {round}");
        let result = client.call_tool("echo", message(&text)).await.unwrap();
        assert_eq!(result.content[0].as_text(), text);
    }

    let pending = tokio::time::timeout(Duration::from_millis(200), client.transport().receive()).await;
    assert!(pending.is_err(), "unexpected queued message: {pending:?}");
    client.close().await;
}
