//! Server role: the dispatcher exposed over SSE+POST and over stdio.

mod http;
mod session;
mod stdio;

pub use http::{router, serve, ServerState, KEEPALIVE_INTERVAL, MAX_BODY_BYTES, MESSAGE_PATH, SSE_PATH};
pub use session::{Session, SessionRegistry};
pub use stdio::{serve_lines, serve_stdio};
