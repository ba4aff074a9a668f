//! The `Tool` trait and its execution context.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::backend::FileChange;
pub use crate::error::ToolError;

/// What a tool may touch while serving one task.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub task_id: String,
    pub job_id: Uuid,
    /// Sandbox root for filesystem tools. Filesystem tools refuse to run without one.
    pub workspace: Option<PathBuf>,
    pub allow_shell: bool,
    pub allow_network: bool,
}

/// Output from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
    /// Files the tool created, modified or deleted.
    pub file_changes: Vec<FileChange>,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self {
            result,
            duration,
            file_changes: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self::success(serde_json::Value::String(text.into()), duration)
    }

    pub fn with_file_change(mut self, change: FileChange) -> Self {
        self.file_changes.push(change);
        self
    }

    /// Render the result for the model.
    pub fn to_model_text(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A capability the API backend can offer to the model.
#[async_trait]
pub trait Tool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Whether the tool runs shell commands (gated by `allow_shell`).
    fn uses_shell(&self) -> bool {
        false
    }

    /// Whether the tool reaches the network (gated by `allow_network`).
    fn uses_network(&self) -> bool {
        false
    }
}

/// Extract a required string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing required string parameter '{key}'"),
        })
}
