//! File tools sandboxed to configured roots. Mutations are recorded in the change ledger.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::changes::{ChangeType, FileChange, FileChangeTracker};
use crate::context::ToolContext;
use crate::executor::{
    Tool, ToolError, ToolFuture, ToolParams, ToolResult, deserialize_params, truncate_tool_output,
};
use crate::registry::ToolDef;

/// Restricts file tools to a set of root directories.
#[derive(Debug)]
pub struct FileSandbox {
    allowed_paths: Vec<PathBuf>,
}

impl FileSandbox {
    /// An empty list allows the process working directory only.
    #[must_use]
    pub fn new(allowed_paths: Vec<PathBuf>) -> Self {
        let paths = if allowed_paths.is_empty() {
            vec![std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))]
        } else {
            allowed_paths
        };
        Self {
            allowed_paths: paths
                .into_iter()
                .map(|p| p.canonicalize().unwrap_or(p))
                .collect(),
        }
    }

    #[must_use]
    pub fn allowed_paths(&self) -> &[PathBuf] {
        &self.allowed_paths
    }

    /// Canonicalize `path` (which may not exist yet) and check it lies under an allowed root.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::SandboxViolation` when the path escapes every root.
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, ToolError> {
        let canonical = resolve_via_ancestors(path);
        // `..` left in the missing tail cannot be resolved without touching the filesystem
        let unresolved = canonical
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if unresolved || !self.allowed_paths.iter().any(|a| canonical.starts_with(a)) {
            tracing::warn!(path = %canonical.display(), "path outside sandbox");
            return Err(ToolError::SandboxViolation {
                path: canonical.display().to_string(),
            });
        }
        Ok(canonical)
    }
}

/// Canonicalize the longest existing ancestor and re-append the missing tail, so `..` and
/// symlinks in the existing part cannot escape the sandbox.
fn resolve_via_ancestors(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut suffix = PathBuf::new();
    while !existing.exists() {
        let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
            break;
        };
        suffix = PathBuf::from(name).join(&suffix);
        existing = parent;
    }
    let base = existing
        .canonicalize()
        .unwrap_or_else(|_| existing.to_path_buf());
    if suffix.as_os_str().is_empty() {
        base
    } else {
        base.join(&suffix)
    }
}

async fn read_existing(path: &Path) -> Result<Option<String>, ToolError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Record the mutation and decorate `result` with its diff stats.
fn record_change(
    changes: &FileChangeTracker,
    tool: &str,
    path: &Path,
    original: Option<String>,
    new: String,
    context: &ToolContext,
    result: ToolResult,
) -> ToolResult {
    let change_type = ChangeType::infer(original.as_deref(), Some(&new));
    let mut change = FileChange::new(path.display().to_string(), change_type, original, Some(new))
        .with_metadata("tool", tool);
    if let Some(id) = context.metadata.get("executionId") {
        change = change.with_metadata("executionId", id.as_str());
    }
    let stats = change.diff_stats();
    changes.record_change(change);

    result
        .with_metadata("path", path.display())
        .with_metadata("change_type", format!("{change_type:?}").to_uppercase())
        .with_metadata("added_lines", stats.added_lines)
        .with_metadata("deleted_lines", stats.deleted_lines)
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadFileParams {
    /// File to read, absolute or relative to the working directory
    path: String,
    /// Number of lines to skip
    #[serde(default)]
    offset: Option<usize>,
    /// Maximum number of lines to return
    #[serde(default)]
    limit: Option<usize>,
}

/// `read-file`: line-numbered file contents.
#[derive(Debug)]
pub struct ReadFileTool {
    sandbox: Arc<FileSandbox>,
}

impl ReadFileTool {
    #[must_use]
    pub fn new(sandbox: Arc<FileSandbox>) -> Self {
        Self { sandbox }
    }

    async fn run(&self, params: ReadFileParams, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = self
            .sandbox
            .validate_path(&context.resolve_path(Path::new(&params.path)))?;
        let content = tokio::fs::read_to_string(&path).await?;

        let offset = params.offset.unwrap_or(0);
        let limit = params.limit.unwrap_or(usize::MAX);
        let selected: Vec<String> = content
            .lines()
            .skip(offset)
            .take(limit)
            .enumerate()
            .map(|(i, line)| format!("{:>4}\t{line}", offset + i + 1))
            .collect();

        Ok(ToolResult::success(truncate_tool_output(&selected.join("\n")))
            .with_metadata("path", path.display())
            .with_metadata("total_lines", content.lines().count()))
    }
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read-file"
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "read-file",
            description: "Read a text file. Lines are numbered from 1.",
            schema: schemars::schema_for!(ReadFileParams),
        }
    }

    fn execute<'a>(&'a self, params: &'a ToolParams, context: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move { self.run(deserialize_params(params)?, context).await })
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteFileParams {
    /// File to write, absolute or relative to the working directory
    path: String,
    /// New content
    content: String,
    /// Create missing parent directories
    #[serde(default = "default_true")]
    create_directories: bool,
    /// Append instead of overwriting
    #[serde(default)]
    append: bool,
}

/// `write-file`: create or overwrite a file.
#[derive(Debug)]
pub struct WriteFileTool {
    sandbox: Arc<FileSandbox>,
    changes: Arc<FileChangeTracker>,
}

impl WriteFileTool {
    #[must_use]
    pub fn new(sandbox: Arc<FileSandbox>, changes: Arc<FileChangeTracker>) -> Self {
        Self { sandbox, changes }
    }

    async fn run(&self, params: WriteFileParams, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = self
            .sandbox
            .validate_path(&context.resolve_path(Path::new(&params.path)))?;
        let original = read_existing(&path).await?;

        if params.create_directories
            && let Some(parent) = path.parent()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let new = match (&original, params.append) {
            (Some(existing), true) => format!("{existing}{}", params.content),
            _ => params.content,
        };
        tokio::fs::write(&path, &new).await?;
        tracing::debug!(path = %path.display(), bytes = new.len(), "file written");

        let result = ToolResult::success(format!("Wrote {} bytes to {}", new.len(), path.display()));
        Ok(record_change(&self.changes, "write-file", &path, original, new, context, result))
    }
}

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write-file"
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "write-file",
            description: "Create or overwrite a text file.",
            schema: schemars::schema_for!(WriteFileParams),
        }
    }

    fn execute<'a>(&'a self, params: &'a ToolParams, context: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move { self.run(deserialize_params(params)?, context).await })
    }
}

fn default_expected_replacements() -> usize {
    1
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EditFileParams {
    /// File to edit, absolute or relative to the working directory
    path: String,
    /// Exact text to replace
    old_string: String,
    /// Replacement text
    new_string: String,
    /// Number of occurrences `old_string` must have
    #[serde(default = "default_expected_replacements")]
    expected_replacements: usize,
}

/// `edit-file`: exact string replacement.
#[derive(Debug)]
pub struct EditFileTool {
    sandbox: Arc<FileSandbox>,
    changes: Arc<FileChangeTracker>,
}

impl EditFileTool {
    #[must_use]
    pub fn new(sandbox: Arc<FileSandbox>, changes: Arc<FileChangeTracker>) -> Self {
        Self { sandbox, changes }
    }

    async fn run(&self, params: EditFileParams, context: &ToolContext) -> Result<ToolResult, ToolError> {
        if params.old_string.is_empty() {
            return Err(ToolError::InvalidParams {
                message: "old_string cannot be empty".into(),
            });
        }
        let path = self
            .sandbox
            .validate_path(&context.resolve_path(Path::new(&params.path)))?;
        let Some(content) = read_existing(&path).await? else {
            return Err(ToolError::Failed(format!("File not found: {}", path.display())));
        };

        let found = content.matches(params.old_string.as_str()).count();
        if found == 0 {
            return Err(ToolError::Failed(format!(
                "old_string not found in {}",
                path.display()
            )));
        }
        if found != params.expected_replacements {
            return Err(ToolError::Failed(format!(
                "Expected {} occurrence(s) of old_string in {} but found {found}",
                params.expected_replacements,
                path.display()
            )));
        }

        let new = content.replace(&params.old_string, &params.new_string);
        tokio::fs::write(&path, &new).await?;
        tracing::debug!(path = %path.display(), replacements = found, "file edited");

        let result = ToolResult::success(format!(
            "Edited {}: replaced {found} occurrence(s)",
            path.display()
        ));
        Ok(record_change(&self.changes, "edit-file", &path, Some(content), new, context, result))
    }
}

impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit-file"
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "edit-file",
            description: "Replace exact text in a file. old_string must occur exactly expected_replacements times.",
            schema: schemars::schema_for!(EditFileParams),
        }
    }

    fn execute<'a>(&'a self, params: &'a ToolParams, context: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move { self.run(deserialize_params(params)?, context).await })
    }
}
