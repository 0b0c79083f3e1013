use super::session::{SessionGuard, SessionRegistry};
use crate::mcp::dispatcher::McpDispatcher;
use crate::mcp::protocol::PROTOCOL_VERSION;
use crate::mcp::transport::SESSION_NOT_FOUND;
use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const SSE_PATH: &str = "/sse";
pub const MESSAGE_PATH: &str = "/message";
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct ServerState {
    dispatcher: Arc<McpDispatcher>,
    sessions: Arc<SessionRegistry>,
    api_key: Option<Arc<str>>,
    started_at: Instant,
}

impl ServerState {
    pub fn new(dispatcher: Arc<McpDispatcher>) -> Self {
        Self {
            dispatcher,
            sessions: Arc::new(SessionRegistry::new()),
            api_key: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.map(Arc::from);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<McpDispatcher> {
        &self.dispatcher
    }
}

pub fn router(state: ServerState) -> Router {
    let protected = Router::new()
        .route(SSE_PATH, get(sse_handler))
        .route(MESSAGE_PATH, post(message_handler))
        .route("/tools", get(tools_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(info_handler))
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves. Open sessions are closed first so their
/// event streams end and the graceful shutdown can complete.
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sessions = Arc::clone(&state.sessions);
    if let Ok(address) = listener.local_addr() {
        info!(%address, auth = state.api_key.is_some(), "tool server listening");
    }
    let shutdown = async move {
        shutdown.await;
        info!(active = sessions.len(), "shutting down; closing sessions");
        sessions.close_all();
    };
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    info!("tool server stopped");
    result
}

async fn require_api_key(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    if provided == Some(expected) {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "rejected request with invalid or missing API key");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized: Invalid or missing API key" })),
    )
        .into_response()
}

async fn sse_handler(
    State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (session, receiver) = state.sessions.create();
    let endpoint = format!("{MESSAGE_PATH}?sessionId={}", session.id());
    let guard = SessionGuard::new(Arc::clone(&state.sessions), session.id().to_string());
    // The registry keeps the sender; holding it here too would stop eviction
    // from ending the stream.
    drop(session);

    let endpoint_event = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let messages = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        let message = receiver.recv().await?;
        Some((
            Ok(Event::default().event("message").data(message)),
            (receiver, guard),
        ))
    });

    Sse::new(endpoint_event.chain(messages)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn message_handler(
    State(state): State<ServerState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Session ID required" })),
        )
            .into_response();
    };
    let Some(session) = state.sessions.get(&session_id) else {
        warn!(session_id = %session_id, "message for unknown session");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": SESSION_NOT_FOUND })),
        )
            .into_response();
    };

    debug!(session_id = %session_id, bytes = body.len(), "received message");
    let Some(reply) = state.dispatcher.handle(&body).await else {
        return StatusCode::ACCEPTED.into_response();
    };
    let reply = String::from_utf8_lossy(&reply).into_owned();
    if !session.push(reply.clone()) {
        debug!(session_id = %session_id, "event stream already closed; reply only in POST body");
    }
    ([(CONTENT_TYPE, "application/json")], reply).into_response()
}

async fn tools_handler(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({ "tools": state.dispatcher.registry().list() }))
}

async fn health_handler(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "tools": state.dispatcher.registry().len(),
        "active_sessions": state.sessions.len(),
    }))
}

async fn info_handler(State(state): State<ServerState>) -> Json<Value> {
    let info = state.dispatcher.server_info();
    let authentication = if state.api_key.is_some() {
        "bearer"
    } else {
        "none"
    };
    Json(json!({
        "name": info.name,
        "version": info.version,
        "protocolVersion": PROTOCOL_VERSION,
        "authentication": authentication,
        "endpoints": {
            "sse": SSE_PATH,
            "message": MESSAGE_PATH,
            "tools": "/tools",
            "health": "/health",
        },
    }))
}
