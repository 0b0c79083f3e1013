//! SSE+POST duplex transport.
//!
//! The client holds a `GET {base}/sse` event stream open. The first `endpoint`
//! event names the URL (carrying the session id) that requests are POSTed to.
//! The POST response body is the reply to that request. Copies of replies
//! that the server also pushes on the stream are dropped; other `message`
//! events (server requests and notifications) are queued for
//! [`Transport::receive`], up to [`INBOUND_CAPACITY`] unread messages.
//!
//! A 404 "Session not found" on POST means the server forgot the session. The
//! transport then tears the stream down, opens a new one, waits for the new
//! endpoint and retries the POST exactly once.

use super::{Transport, TransportError, DEFAULT_ENDPOINT_TIMEOUT, SESSION_NOT_FOUND};
use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::utils::url::{resolve_endpoint, strip_path_suffix};

const SSE_PATH: &str = "/sse";
const JSON_CONTENT_TYPE: &str = "application/json";
const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;
const POST_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_SETTLE: Duration = Duration::from_millis(100);

/// Unread server-initiated messages kept before new ones are dropped.
pub const INBOUND_CAPACITY: usize = 64;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split lines anywhere. Events are emitted on the blank line that
/// terminates them; comment lines (`:`) and events without data are dropped.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseEventParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = memchr(b'\n', &self.buffer[start..]) {
            let end = start + offset;
            let line = self.buffer[start..end]
                .strip_suffix(b"\r")
                .unwrap_or(&self.buffer[start..end]);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.buffer.drain(..start);

        let mut events = Vec::new();
        for line in lines {
            self.process_line(&line, &mut events);
        }
        events
    }

    /// Flushes a trailing unterminated line and any pending event.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.process_line(line.trim_end_matches('\r'), &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if let Some(comment) = line.strip_prefix(':') {
            trace!(comment = comment.trim(), "sse comment");
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.trim().to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event = self.event.take();
        if self.data.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        events.push(SseEvent { event, data });
    }
}

fn is_session_not_found(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND && body.contains(SESSION_NOT_FOUND)
}

/// A JSON-RPC response rather than a server request or notification. The
/// POST body already delivered it to the caller.
fn is_reply(data: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(serde_json::Value::Object(message)) => {
            !message.contains_key("method")
                && (message.contains_key("result") || message.contains_key("error"))
        }
        _ => false,
    }
}

enum PostOutcome {
    Reply(Option<String>),
    SessionExpired,
}

struct Connection {
    generation: u64,
    endpoint: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

pub struct SseTransport {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    endpoint_timeout: Duration,
    active: Arc<AtomicBool>,
    generation: AtomicU64,
    connection: Mutex<Option<Connection>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    inbound_tx: Mutex<Option<mpsc::Sender<String>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl SseTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .pool_idle_timeout(HTTP_POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
            .build()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Ok(Self {
            client,
            base_url: strip_path_suffix(base_url, SSE_PATH),
            headers: HeaderMap::new(),
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
            active: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
            connection: Mutex::new(None),
            reconnect_lock: tokio::sync::Mutex::new(()),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    pub fn with_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout = timeout;
        self
    }

    pub fn with_bearer_token(self, token: &str) -> Result<Self, TransportError> {
        self.with_header(AUTHORIZATION.as_str(), &format!("Bearer {token}"))
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, TransportError> {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidHeader(name.as_str().to_string()))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The POST endpoint announced on the current stream, if any.
    pub fn endpoint(&self) -> Option<String> {
        self.lock_connection()
            .as_ref()
            .and_then(|connection| connection.endpoint.borrow().clone())
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_stream(&self) -> Result<(), TransportError> {
        let inbound = self
            .inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.store(true, Ordering::SeqCst);

        let reader = EventStreamReader {
            client: self.client.clone(),
            url: format!("{}{SSE_PATH}", self.base_url),
            base_url: self.base_url.clone(),
            headers: self.headers.clone(),
            active: Arc::clone(&self.active),
            endpoint: endpoint_tx,
            inbound,
            generation,
        };
        let reader = tokio::spawn(reader.run(cancel.clone()));
        debug!(generation, base_url = %self.base_url, "opened event stream");

        let previous = self.lock_connection().replace(Connection {
            generation,
            endpoint: endpoint_rx,
            cancel,
            reader,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.reader.abort();
        }
        Ok(())
    }

    async fn stop_stream(&self) {
        self.active.store(false, Ordering::SeqCst);
        let previous = self.lock_connection().take();
        if let Some(Connection {
            generation,
            cancel,
            mut reader,
            ..
        }) = previous
        {
            cancel.cancel();
            if tokio::time::timeout(RECONNECT_SETTLE, &mut reader)
                .await
                .is_err()
            {
                reader.abort();
            }
            debug!(generation, "stopped event stream");
        }
    }

    /// Waits for the current stream to announce its endpoint.
    async fn wait_for_endpoint(&self) -> Result<(String, u64), TransportError> {
        let (mut endpoint, generation) = {
            let connection = self.lock_connection();
            let connection = connection.as_ref().ok_or(TransportError::NotConnected)?;
            (connection.endpoint.clone(), connection.generation)
        };
        let wait = async {
            endpoint
                .wait_for(Option::is_some)
                .await
                .map(|value| (*value).clone())
        };
        match tokio::time::timeout(self.endpoint_timeout, wait).await {
            Ok(Ok(Some(endpoint))) => Ok((endpoint, generation)),
            Ok(Ok(None)) | Ok(Err(_)) => Err(TransportError::StreamClosed),
            Err(_) => Err(TransportError::EndpointTimeout(self.endpoint_timeout)),
        }
    }

    /// Replaces the stream unless another caller already did so since
    /// `observed_generation` was read.
    async fn reconnect(&self, observed_generation: u64) -> Result<(), TransportError> {
        let _guard = self.reconnect_lock.lock().await;
        let current = self.generation.load(Ordering::SeqCst);
        if current != observed_generation {
            debug!(
                observed_generation,
                current, "stream already replaced by a concurrent reconnect"
            );
            return Ok(());
        }

        info!(base_url = %self.base_url, "session expired; reconnecting event stream");
        self.stop_stream().await;
        tokio::time::sleep(RECONNECT_SETTLE).await;
        self.open_stream()?;
        self.wait_for_endpoint().await?;
        info!(base_url = %self.base_url, "event stream reconnected");
        Ok(())
    }

    async fn post(&self, endpoint: &str, payload: &str) -> Result<PostOutcome, TransportError> {
        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .timeout(POST_TIMEOUT)
            .body(payload.to_string())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if is_session_not_found(status, &body) {
            return Ok(PostOutcome::SessionExpired);
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            Ok(PostOutcome::Reply(None))
        } else {
            Ok(PostOutcome::Reply(Some(body)))
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.open_stream()?;
        match self.wait_for_endpoint().await {
            Ok((endpoint, _)) => {
                info!(endpoint = %endpoint, "SSE transport ready");
                Ok(())
            }
            Err(err) => {
                self.stop_stream().await;
                Err(err)
            }
        }
    }

    async fn send(&self, message: String) -> Result<Option<String>, TransportError> {
        let (endpoint, generation) = self.wait_for_endpoint().await?;
        trace!(endpoint = %endpoint, "posting message");
        match self.post(&endpoint, &message).await? {
            PostOutcome::Reply(reply) => Ok(reply),
            PostOutcome::SessionExpired => {
                warn!(endpoint = %endpoint, "server reported unknown session");
                self.reconnect(generation).await?;
                let (endpoint, _) = self.wait_for_endpoint().await?;
                match self.post(&endpoint, &message).await? {
                    PostOutcome::Reply(reply) => Ok(reply),
                    PostOutcome::SessionExpired => Err(TransportError::SessionExpired),
                }
            }
        }
    }

    async fn receive(&self) -> Option<String> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.stop_stream().await;
        self.inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(base_url = %self.base_url, "SSE transport closed");
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.lock_connection().take() {
            connection.cancel.cancel();
            connection.reader.abort();
        }
    }
}

struct EventStreamReader {
    client: reqwest::Client,
    url: String,
    base_url: String,
    headers: HeaderMap,
    active: Arc<AtomicBool>,
    endpoint: watch::Sender<Option<String>>,
    inbound: mpsc::Sender<String>,
    generation: u64,
}

impl EventStreamReader {
    async fn run(self, cancel: CancellationToken) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.pump() => result,
        };
        match result {
            Err(err) if self.active.load(Ordering::SeqCst) && !cancel.is_cancelled() => {
                warn!(generation = self.generation, error = %err, "event stream failed");
            }
            _ => debug!(generation = self.generation, "event stream reader stopped"),
        }
    }

    async fn pump(&self) -> Result<(), TransportError> {
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, EVENT_STREAM_CONTENT_TYPE)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseEventParser::default();
        while self.active.load(Ordering::SeqCst) {
            let Some(chunk) = stream.next().await else {
                break;
            };
            for event in parser.push(&chunk?) {
                self.dispatch(event);
            }
        }
        for event in parser.finish() {
            self.dispatch(event);
        }
        debug!(generation = self.generation, "event stream ended");
        Ok(())
    }

    fn dispatch(&self, event: SseEvent) {
        match event.event.as_deref() {
            Some("endpoint") => {
                let endpoint = resolve_endpoint(&self.base_url, &event.data);
                let learned = self.endpoint.send_if_modified(|current| {
                    if current.is_none() {
                        *current = Some(endpoint.clone());
                        true
                    } else {
                        false
                    }
                });
                if learned {
                    debug!(generation = self.generation, endpoint = %endpoint, "received endpoint");
                } else {
                    debug!(endpoint = %endpoint, "ignoring repeated endpoint event");
                }
            }
            _ if is_reply(&event.data) => {
                trace!(generation = self.generation, "dropping streamed copy of a POST reply");
            }
            _ => match self.inbound.try_send(event.data) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(capacity = INBOUND_CAPACITY, "inbound queue full; dropping server message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("inbound queue closed; dropping server message");
                }
            },
        }
    }
}
