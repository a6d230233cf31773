//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::UserBlock;

/// Output of one tool execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    /// Model-visible content blocks.
    #[serde(default)]
    pub content: Vec<UserBlock>,
    /// Opaque details for the embedder (not sent to the model).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolOutput {
    /// Plain-text output.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![UserBlock::Text { text: text.into() }],
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Callback for streaming partial results during a long-running execution.
pub type ToolUpdateFn = Arc<dyn Fn(ToolOutput) + Send + Sync>;

/// Core tool trait — implement to expose a capability to the model.
///
/// Calls originating from a single assistant message are executed
/// sequentially in the message's call order; implementations never see
/// concurrent calls from the same run. A cancellation signal received
/// mid-execution must settle the call (success, error, or canceled) without
/// leaving state behind that corrupts the next call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the argument payload.
    fn parameters(&self) -> &Value;

    /// Execute the tool.
    async fn execute(
        &self,
        call_id: &str,
        args: &Value,
        cancel: CancellationToken,
        on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolOutput>;
}

/// Type alias for the tool handler function.
type ToolHandler = dyn Fn(String, Value, CancellationToken) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
pub struct FnTool {
    name: String,
    description: String,
    parameters: Value,
    handler: Arc<ToolHandler>,
}

impl FnTool {
    /// Create a tool from a closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(String, Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |call_id, args, cancel| {
                Box::pin(handler(call_id, args, cancel))
            }),
        }
    }

    /// An object schema with no parameters.
    pub fn empty_parameters() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": [],
        })
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

    fn parameters(&self) -> &Value {
        &self.parameters
    }

    async fn execute(
        &self,
        call_id: &str,
        args: &Value,
        cancel: CancellationToken,
        _on_update: Option<ToolUpdateFn>,
    ) -> Result<ToolOutput> {
        (self.handler)(call_id.to_string(), args.clone(), cancel).await
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}
