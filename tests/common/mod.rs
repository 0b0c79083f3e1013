#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use toolweave::mcp::dispatcher::McpDispatcher;
use toolweave::mcp::protocol::Implementation;
use toolweave::mcp::registry::ToolRegistry;
use toolweave::mcp::server::{serve, ServerState, SessionRegistry};
use toolweave::tools::EchoTool;

pub struct TestServer {
    pub addr: SocketAddr,
    pub sessions: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Serves the echo tool on an ephemeral port.
pub async fn spawn_server(api_key: Option<&str>) -> TestServer {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(EchoTool::new()));
    let dispatcher = McpDispatcher::new(registry, Implementation::new("test-server", "1.0.0"));
    let state = ServerState::new(Arc::new(dispatcher)).with_api_key(api_key.map(str::to_string));
    let sessions = Arc::clone(state.sessions());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = serve(listener, state, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    TestServer {
        addr,
        sessions,
        shutdown: Some(shutdown_tx),
    }
}

/// A parsed HTTP/1.1 request as seen by a hand-rolled peer.
pub struct RawRequest {
    pub method: String,
    pub target: String,
    pub body: String,
}

/// Reads one request head and its `Content-Length` body.
pub async fn read_request(stream: &mut TcpStream) -> Option<RawRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut request_line = head.lines().next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buffer[head_end..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    Some(RawRequest {
        method,
        target,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

/// Starts an event stream response and optionally announces an endpoint,
/// then holds the connection until the client hangs up.
pub async fn hold_event_stream(mut stream: TcpStream, endpoint: Option<String>) {
    let mut response = String::from(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
    );
    if let Some(endpoint) = endpoint {
        response.push_str(&format!("event: endpoint\ndata: {endpoint}\n\n"));
    }
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }
    let mut sink = [0u8; 256];
    while let Ok(read) = stream.read(&mut sink).await {
        if read == 0 {
            break;
        }
    }
}

pub async fn respond(mut stream: TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
