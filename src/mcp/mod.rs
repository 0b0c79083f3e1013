//! JSON-RPC tool protocol: envelope, tool registry, dispatcher, the server
//! that exposes them, and the client side that consumes remote servers.

pub mod client;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
