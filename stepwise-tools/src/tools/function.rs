use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use crate::error::ToolError;
use crate::execution_context::ExecutionContext;
use crate::tools::base::{Tool, ToolResult};

type Handler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, ToolError>>
        + Send
        + Sync,
>;

/// A capability backed by an async closure.
///
/// Lets an entry point register `name -> (args) -> result` entries without
/// writing a dedicated type for each one.
pub struct FnTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Arc::new(move |input| handler(input).boxed()),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    async fn execute(
        &self,
        _ctx: ExecutionContext,
        input: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let output = (self.handler)(input).await?;
        Ok(ToolResult::ok(output))
    }
}
