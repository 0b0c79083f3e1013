//! toolweave lets a language model call tools hosted by independent server
//! processes and weaves the results back into the conversation.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] holds the JSON-RPC envelope, the tool registry and dispatcher,
//!   the SSE+POST and stdio transports in both server and client roles, and
//!   the client manager that routes calls to configured servers.
//! - [`core`] owns configuration, conversation state, output sanitization and
//!   the tool-calling orchestrator with its model client.
//! - [`tools`] provides the built-in tools served by `toolweave serve`.
//! - [`api`] defines the chat-completions payloads sent to the model.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod logging;
pub mod mcp;
pub mod tools;
pub mod utils;
