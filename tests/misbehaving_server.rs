mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Map;
use tokio::net::TcpListener;

use toolweave::mcp::client::{McpClient, McpClientError};
use toolweave::mcp::transport::{SseTransport, Transport, TransportError};

#[derive(Default)]
struct Counters {
    streams: AtomicUsize,
    posts: AtomicUsize,
}

/// Peer that opens event streams (announcing an endpoint when `announce`)
/// and answers every POST with `404 Session not found`.
async fn spawn_peer(announce: bool) -> (String, Arc<Counters>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let counters = Arc::new(Counters::default());
    let shared = Arc::clone(&counters);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counters = Arc::clone(&shared);
            tokio::spawn(async move {
                let Some(request) = common::read_request(&mut stream).await else {
                    return;
                };
                match request.method.as_str() {
                    "GET" if request.target.starts_with("/sse") => {
                        let id = counters.streams.fetch_add(1, Ordering::SeqCst);
                        let endpoint = announce.then(|| format!("/message?sessionId=s{id}"));
                        common::hold_event_stream(stream, endpoint).await;
                    }
                    "POST" => {
                        counters.posts.fetch_add(1, Ordering::SeqCst);
                        common::respond(stream, "404 Not Found", r#"{"error":"Session not found"}"#)
                            .await;
                    }
                    _ => common::respond(stream, "400 Bad Request", "{}").await,
                }
            });
        }
    });
    (base_url, counters)
}

#[tokio::test]
async fn silent_stream_times_out_waiting_for_endpoint() {
    let (base_url, counters) = spawn_peer(false).await;
    let transport = SseTransport::new(&base_url)
        .unwrap()
        .with_endpoint_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let err = transport.start().await.unwrap_err();
    assert!(matches!(err, TransportError::EndpointTimeout(_)), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.to_string().starts_with("Timeout: server did not send endpoint event"));
    assert!(!transport.is_active());
    assert_eq!(counters.streams.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_unknown_session_fails_after_one_reconnect() {
    let (base_url, counters) = spawn_peer(true).await;
    let client = McpClient::new(SseTransport::new(&base_url).unwrap());
    client.transport().start().await.unwrap();

    let err = client.call_tool("echo", Map::new()).await.unwrap_err();
    assert!(
        matches!(err, McpClientError::Transport(TransportError::SessionExpired)),
        "got {err:?}"
    );
    assert_eq!(counters.streams.load(Ordering::SeqCst), 2);
    assert_eq!(counters.posts.load(Ordering::SeqCst), 2);
    client.close().await;
}

#[tokio::test]
async fn unreachable_server_fails_to_start() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = SseTransport::new(&base_url)
        .unwrap()
        .with_endpoint_timeout(Duration::from_secs(2));
    let err = transport.start().await.unwrap_err();
    assert!(
        matches!(err, TransportError::StreamClosed | TransportError::EndpointTimeout(_)),
        "got {err:?}"
    );
}
