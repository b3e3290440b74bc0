use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ToolDefinition;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {name}")]
    NotFound { name: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

/// Local tool execution boundary. Results are untrusted text as far as
/// the relay is concerned; they are forwarded, never interpreted.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The capability set declared to the model with each request.
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn execute(
        &self,
        name: &str,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Table-driven executor double: canned output per tool name.
#[derive(Default)]
pub struct MockToolExecutor {
    outputs: HashMap<String, serde_json::Value>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: &str, output: serde_json::Value) -> Self {
        self.outputs.insert(name.to_string(), output);
        self
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut names: Vec<&String> = self.outputs.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| ToolDefinition {
                name: name.clone(),
                description: format!("mock tool {name}"),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    async fn execute(
        &self,
        name: &str,
        _input: &serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound {
                name: name.to_string(),
            })
    }
}
