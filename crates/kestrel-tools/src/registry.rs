use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::changes::FileChangeTracker;
use crate::config::ToolsConfig;
use crate::executor::Tool;
use crate::file::{EditFileTool, FileSandbox, ReadFileTool, WriteFileTool};
use crate::policy::PermissionPolicy;
use crate::process::{KillProcessTool, ReadProcessTool, WaitProcessTool};
use crate::shell::{ShellExecutor, ShellSessionManager, ShellTool};

/// Static description of a tool and its parameter schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: schemars::Schema,
}

/// Tools addressable by name. Registering a name twice replaces the earlier tool.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shell, process management and file tools sharing one session registry and one change
    /// ledger.
    #[must_use]
    pub fn builtin(
        config: &ToolsConfig,
        sessions: Arc<ShellSessionManager>,
        changes: Arc<FileChangeTracker>,
    ) -> Self {
        let executor = Arc::new(ShellExecutor::new(&config.shell));
        let sandbox = Arc::new(FileSandbox::new(
            config.files.allowed_paths.iter().map(PathBuf::from).collect(),
        ));

        let mut registry = Self::new();
        registry.register(Arc::new(ShellTool::new(executor, Arc::clone(&sessions))));
        registry.register(Arc::new(ReadProcessTool::new(Arc::clone(&sessions))));
        registry.register(Arc::new(WaitProcessTool::new(Arc::clone(&sessions))));
        registry.register(Arc::new(KillProcessTool::new(sessions)));
        registry.register(Arc::new(ReadFileTool::new(Arc::clone(&sandbox))));
        registry.register(Arc::new(WriteFileTool::new(
            Arc::clone(&sandbox),
            Arc::clone(&changes),
        )));
        registry.register(Arc::new(EditFileTool::new(sandbox, changes)));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    #[must_use]
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Definitions of tools not fully denied by `policy`.
    #[must_use]
    pub fn available_definitions(&self, policy: &PermissionPolicy) -> Vec<ToolDef> {
        self.tools
            .iter()
            .filter(|t| !policy.is_fully_denied(t.name()))
            .map(|t| t.definition())
            .collect()
    }
}
