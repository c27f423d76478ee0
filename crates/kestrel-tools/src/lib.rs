//! Tool orchestration, shell sessions and file change tracking.

pub mod audit;
pub mod changes;
pub mod config;
pub mod context;
pub mod executor;
pub mod file;
pub mod orchestrator;
pub mod policy;
pub mod process;
pub mod registry;
pub mod render;
pub mod shell;
pub mod state;

pub use audit::{AuditEntry, AuditLogger, AuditResult};
pub use changes::{ChangeType, FileChange, FileChangeListener, FileChangeTracker};
pub use config::{AuditConfig, FileConfig, OrchestratorConfig, ShellConfig, ToolsConfig};
pub use context::{ExecutionId, ToolContext, ToolExecutionContext};
pub use executor::{
    MAX_TOOL_OUTPUT_CHARS, Metadata, Tool, ToolCall, ToolError, ToolFuture, ToolParams, ToolResult,
    truncate_tool_output,
};
pub use file::{EditFileTool, FileSandbox, ReadFileTool, WriteFileTool};
pub use orchestrator::{ToolExecutionResult, ToolOrchestrator};
pub use policy::{AllowAll, PermissionPolicy, PermissionRule, PermissionsConfig, PolicyDecision, PolicyEngine};
pub use process::{KillProcessTool, ReadProcessTool, WaitProcessTool};
pub use registry::{ToolDef, ToolRegistry};
pub use render::{Renderer, TracingRenderer};
pub use shell::{
    LiveShellSession, ManagedSession, ShellExecutionConfig, ShellExecutor, ShellResult,
    ShellSessionManager, ShellTool,
};
pub use state::{StateEventTx, ToolExecutionState, ToolStateManager};
