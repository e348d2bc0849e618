use crate::error::ToolError;
use crate::execution_context::ExecutionContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Outcome of one capability call, as seen by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// JSON rendering used for tool-response turns and `tool` events.
    pub fn to_value(&self) -> serde_json::Value {
        match (&self.output, &self.error) {
            (Some(output), None) => json!({"success": self.success, "output": output}),
            (Some(output), Some(error)) => {
                json!({"success": self.success, "output": output, "error": error})
            }
            (None, Some(error)) => json!({"success": self.success, "error": error}),
            (None, None) => json!({"success": self.success}),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        ctx: ExecutionContext,
        input: serde_json::Value,
    ) -> Result<ToolResult, ToolError>;
}
