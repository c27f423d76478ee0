use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::context::ToolContext;
use crate::registry::ToolDef;

/// Raw parameters of a tool invocation, as produced by the agent.
pub type ToolParams = HashMap<String, serde_json::Value>;

/// String bag attached to results and changes for downstream observability.
pub type Metadata = BTreeMap<String, String>;

fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A single named, parameterized request. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default = "new_call_id")]
    pub id: String,
    #[serde(alias = "tool")]
    pub tool_name: String,
    #[serde(default)]
    pub params: ToolParams,
}

impl ToolCall {
    #[must_use]
    pub fn new(tool_name: impl Into<String>, params: ToolParams) -> Self {
        Self {
            id: new_call_id(),
            tool_name: tool_name.into(),
            params,
        }
    }
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResult {
    Success {
        content: String,
        metadata: Metadata,
    },
    Error {
        message: String,
        error_type: Option<String>,
        metadata: Metadata,
    },
    AgentResult {
        content: String,
        success: bool,
        metadata: Metadata,
    },
    /// A long-running tool handed its work to a background session.
    Pending {
        session_id: String,
        tool_name: String,
        command: String,
        message: String,
        metadata: Metadata,
    },
}

impl ToolResult {
    #[must_use]
    pub fn success(content: impl Into<String>) -> Self {
        Self::Success {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            error_type: None,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn pending(
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Pending {
            session_id: session_id.into(),
            tool_name: tool_name.into(),
            command: command.into(),
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    /// Error result carrying the error's `error_type` tag.
    #[must_use]
    pub fn from_error(message: impl Into<String>, error: &ToolError) -> Self {
        Self::Error {
            message: message.into(),
            error_type: Some(error.error_type().to_owned()),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata_mut().insert(key.into(), value.to_string());
        self
    }

    /// True only for `Success` and a successful `AgentResult`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        match self {
            Self::Success { .. } => true,
            Self::AgentResult { success, .. } => *success,
            Self::Error { .. } | Self::Pending { .. } => false,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        match self {
            Self::Success { metadata, .. }
            | Self::Error { metadata, .. }
            | Self::AgentResult { metadata, .. }
            | Self::Pending { metadata, .. } => metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Self::Success { metadata, .. }
            | Self::Error { metadata, .. }
            | Self::AgentResult { metadata, .. }
            | Self::Pending { metadata, .. } => metadata,
        }
    }

    /// Human readable text of the result regardless of variant.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Success { content, .. } | Self::AgentResult { content, .. } => content,
            Self::Error { message, .. } | Self::Pending { message, .. } => message,
        }
    }

    /// Why this result does not count as a success, if it doesn't.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        if self.is_success() {
            None
        } else {
            Some(self.text())
        }
    }
}

impl fmt::Display for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

pub const MAX_TOOL_OUTPUT_CHARS: usize = 30_000;

/// Truncate tool output that exceeds `MAX_TOOL_OUTPUT_CHARS` using head+tail split.
#[must_use]
pub fn truncate_tool_output(output: &str) -> String {
    if output.len() <= MAX_TOOL_OUTPUT_CHARS {
        return output.to_string();
    }

    let half = MAX_TOOL_OUTPUT_CHARS / 2;
    let mut head_end = half;
    while !output.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = output.len() - half;
    while !output.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let omitted = tail_start - head_end;

    format!(
        "{}\n\n... [truncated {omitted} chars, showing first and last ~{half} chars] ...\n\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

/// Errors that can occur during tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool execution denied by policy: {tool}")]
    PolicyDenied { tool: String },

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("command blocked by policy: {command}")]
    Blocked { command: String },

    #[error("path not allowed by sandbox: {path}")]
    SandboxViolation { path: String },

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid tool parameters: {message}")]
    InvalidParams { message: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("{0}")]
    Failed(String),

    #[error("execution failed: {0}")]
    Execution(#[from] std::io::Error),
}

impl ToolError {
    /// Stable tag copied into result metadata.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::PolicyDenied { .. } => "policy_denied",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::Blocked { .. } => "blocked",
            Self::SandboxViolation { .. } => "sandbox_violation",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotSupported(_) => "not_supported",
            Self::InvalidParams { .. } => "invalid_params",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::Failed(_) | Self::Execution(_) => "execution",
        }
    }
}

/// Deserialize tool call params into a typed struct.
///
/// # Errors
///
/// Returns `ToolError::InvalidParams` when deserialization fails.
pub fn deserialize_params<T: serde::de::DeserializeOwned, S: std::hash::BuildHasher>(
    params: &HashMap<String, serde_json::Value, S>,
) -> Result<T, ToolError> {
    let obj =
        serde_json::Value::Object(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    serde_json::from_value(obj).map_err(|e| ToolError::InvalidParams {
        message: e.to_string(),
    })
}

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolResult, ToolError>> + Send + 'a>>;

/// A callable tool. Object safe so the registry can hold heterogeneous tools.
///
/// Tools see only the narrowed [`ToolContext`]; orchestration fields (ids, retries, dry run)
/// stay with the orchestrator. Returning `Err` is equivalent to the tool throwing: the
/// orchestrator turns it into a failed execution.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDef;

    fn execute<'a>(&'a self, params: &'a ToolParams, context: &'a ToolContext) -> ToolFuture<'a>;
}
