//! Tools served by `toolweave serve`.

use std::sync::Arc;

use crate::mcp::registry::{Tool, ToolError, ToolPlugin};

pub mod echo;
pub mod weather;

pub use echo::EchoTool;
pub use weather::{OpenMeteoEndpoints, WeatherTool};

/// The built-in tool bundle.
pub struct BuiltinTools {
    tools: Vec<Arc<dyn Tool>>,
}

impl BuiltinTools {
    pub fn new() -> Result<Self, ToolError> {
        Self::with_weather_endpoints(OpenMeteoEndpoints::default())
    }

    pub fn with_weather_endpoints(endpoints: OpenMeteoEndpoints) -> Result<Self, ToolError> {
        Ok(Self {
            tools: vec![
                Arc::new(WeatherTool::with_endpoints(endpoints)?),
                Arc::new(EchoTool::new()),
            ],
        })
    }
}

impl ToolPlugin for BuiltinTools {
    fn name(&self) -> &str {
        "builtin"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}
