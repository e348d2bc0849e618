use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, warn};
use crate::error::ToolError;
use crate::execution_context::ExecutionContext;
use crate::registry::ToolRegistry;
use crate::tools::ToolResult;

const MAX_INPUT_BYTES: usize = 1_000_000;

/// Invokes capabilities from a lane's table.
///
/// `invoke` never returns an error: lookup failures, invalid input,
/// capability errors, panics and timeouts all come back as a failed
/// [`ToolResult`] so the run can hand them to the model.
pub struct ToolAdapter {
    registry: Arc<ToolRegistry>,
    timeout_ms: u64,
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ToolAdapter {
    pub fn new(registry: Arc<ToolRegistry>, timeout_ms: u64) -> Self {
        Self {
            registry,
            timeout_ms,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub async fn invoke(
        &self,
        session_id: &str,
        run_id: &str,
        call_id: &str,
        tool_name: &str,
        input: serde_json::Value,
    ) -> ToolResult {
        debug!(run_id, call_id, tool = tool_name, "Invoking tool");
        let ctx = ExecutionContext::new(
            session_id.to_string(),
            run_id.to_string(),
            call_id.to_string(),
            self.timeout_ms,
        );

        match self.try_invoke(ctx, tool_name, input).await {
            Ok(result) => result,
            Err(e) => {
                warn!(run_id, call_id, tool = tool_name, error = %e, "Tool invocation failed");
                ToolResult::failed(e.to_string())
            }
        }
    }

    async fn try_invoke(
        &self,
        ctx: ExecutionContext,
        tool_name: &str,
        input: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        validate_input(&input)?;

        let timeout_ms = ctx.timeout_ms;
        // Spawned so a panicking capability cannot take the run down with it.
        let mut handle = AbortOnDrop(tokio::spawn(async move { tool.execute(ctx, input).await }));

        match timeout(Duration::from_millis(timeout_ms), &mut handle.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    error!(tool = tool_name, "Tool execution panicked");
                } else {
                    error!(tool = tool_name, "Tool execution cancelled");
                }
                Err(ToolError::Internal)
            }
            Err(_) => {
                warn!(tool = tool_name, "Tool execution timed out after {}ms", timeout_ms);
                Err(ToolError::Timeout(timeout_ms))
            }
        }
    }
}

fn validate_input(input: &serde_json::Value) -> Result<(), ToolError> {
    if !input.is_object() {
        return Err(ToolError::ValidationError(
            "Tool input must be a JSON object".into(),
        ));
    }

    if let Ok(serialized) = serde_json::to_string(input) {
        if serialized.len() > MAX_INPUT_BYTES {
            return Err(ToolError::ValidationError(format!(
                "Tool input exceeds {} bytes",
                MAX_INPUT_BYTES
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_rejects_non_object() {
        assert!(validate_input(&json!(null)).is_err());
        assert!(validate_input(&json!("text")).is_err());
        assert!(validate_input(&json!([1, 2])).is_err());
        assert!(validate_input(&json!({})).is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let big = "x".repeat(MAX_INPUT_BYTES + 1);
        assert!(validate_input(&json!({"data": big})).is_err());
    }
}
