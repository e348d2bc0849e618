//! Tool capability adapter for the stepwise agent runtime.

pub mod adapter;
pub mod error;
pub mod execution_context;
pub mod registry;
pub mod tools;

pub use adapter::ToolAdapter;
pub use error::ToolError;
pub use execution_context::ExecutionContext;
pub use registry::ToolRegistry;
pub use tools::{CurrentTimeTool, FnTool, HttpFetchTool, Tool, ToolResult};

/// Registry holding the capabilities shipped with the workspace.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(std::sync::Arc::new(HttpFetchTool::new()))
        .register(std::sync::Arc::new(CurrentTimeTool));
    registry
}
