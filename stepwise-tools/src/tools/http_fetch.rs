use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use crate::error::ToolError;
use crate::execution_context::ExecutionContext;
use crate::tools::base::{Tool, ToolResult};

const DEFAULT_MAX_BYTES: usize = 64 * 1024;

#[derive(Deserialize)]
struct HttpFetchInput {
    url: String,
    #[serde(default)]
    max_bytes: Option<usize>,
}

/// Fetches a URL over HTTP(S) and returns the (truncated) body text.
pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("stepwise/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetches a web page or API response by URL and returns its text"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http or https URL"},
                "max_bytes": {"type": "integer", "minimum": 1}
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        _ctx: ExecutionContext,
        input: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let input: HttpFetchInput = serde_json::from_value(input)
            .map_err(|e| ToolError::ValidationError(e.to_string()))?;

        if !(input.url.starts_with("http://") || input.url.starts_with("https://")) {
            return Err(ToolError::ValidationError(format!(
                "Unsupported URL scheme: {}",
                input.url
            )));
        }

        let response = self
            .client
            .get(&input.url)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let limit = input.max_bytes.unwrap_or(DEFAULT_MAX_BYTES);
        let (body, truncated) = truncate_utf8(&body, limit);

        Ok(ToolResult {
            success: status.is_success(),
            output: Some(json!({
                "status": status.as_u16(),
                "body": body,
                "truncated": truncated,
            })),
            error: if status.is_success() {
                None
            } else {
                Some(format!("HTTP {}", status))
            },
        })
    }
}

fn truncate_utf8(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        let (text, truncated) = truncate_utf8("héllo", 2);
        assert_eq!(text, "h");
        assert!(truncated);

        let (text, truncated) = truncate_utf8("short", 100);
        assert_eq!(text, "short");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let tool = HttpFetchTool::new();
        let ctx = ExecutionContext::new("s".into(), "r".into(), "c".into(), 1000);
        let result = tool.execute(ctx, json!({"url": "file:///etc/passwd"})).await;
        assert!(matches!(result, Err(ToolError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_rejects_missing_url() {
        let tool = HttpFetchTool::new();
        let ctx = ExecutionContext::new("s".into(), "r".into(), "c".into(), 1000);
        let result = tool.execute(ctx, json!({})).await;
        assert!(matches!(result, Err(ToolError::ValidationError(_))));
    }
}
