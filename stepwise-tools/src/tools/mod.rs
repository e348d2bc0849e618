pub mod base;
pub mod clock;
pub mod function;
pub mod http_fetch;

pub use base::{Tool, ToolResult};
pub use clock::CurrentTimeTool;
pub use function::FnTool;
pub use http_fetch::HttpFetchTool;
