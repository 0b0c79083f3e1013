pub mod chat_client;
pub mod config;
pub mod message;
pub mod orchestrator;
pub mod sanitize;
pub mod tool_router;
