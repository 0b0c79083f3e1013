pub mod data;
pub mod io;

pub use data::{Config, McpServerConfig, ModelConfig, ServerConfig};
pub use io::ConfigError;
