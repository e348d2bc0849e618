use async_trait::async_trait;
use serde_json::json;
use crate::error::ToolError;
use crate::execution_context::ExecutionContext;
use crate::tools::base::{Tool, ToolResult};

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Returns the current UTC date and time"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(
        &self,
        _ctx: ExecutionContext,
        _input: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let now = chrono::Utc::now();
        Ok(ToolResult::ok(json!({
            "utc": now.to_rfc3339(),
            "unix": now.timestamp(),
        })))
    }
}
