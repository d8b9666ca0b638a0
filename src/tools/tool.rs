//! Tool trait definition
//!
//! Tools are the application's business operations (budget forecasting, compliance
//! scoring, ...) exposed to the model as callable functions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declaration sent to the model: name, description and JSON-schema parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of executing a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The output of the tool
    pub output: String,
    /// Whether the tool execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful tool result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Create an error tool result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            is_error: true,
        }
    }
}

/// Trait for operations the model may call
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the name of this tool
    fn name(&self) -> &str;

    /// Get a description of this tool
    fn description(&self) -> &str;

    /// JSON schema of the arguments
    fn parameters(&self) -> Value;

    /// Build the declaration published to the model
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }

    /// Invoke the tool with arguments matching [`parameters`](Tool::parameters)
    async fn invoke(&self, arguments: &Value) -> Result<ToolResult>;
}

type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<ToolResult>> + Send>> + Send + Sync>;

/// A tool built from a name, description, schema and async closure
///
/// ```ignore
/// let tool = FnTool::new(
///     "budget_variance",
///     "Variance between budgeted and actual spend for an enterprise",
///     json!({"type": "object", "properties": {"enterprise": {"type": "string"}}}),
///     |args| async move { Ok(ToolResult::success(format!("{args}"))) },
/// );
/// ```
pub struct FnTool {
    name: String,
    description: String,
    parameters: Value,
    handler: ToolHandler,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolResult>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args| Box::pin(handler(args))),
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

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn invoke(&self, arguments: &Value) -> Result<ToolResult> {
        (self.handler)(arguments.clone()).await
    }
}
