use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::executor::Metadata;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

static NEXT_EXECUTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing execution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExecutionId(u64);

impl ExecutionId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_EXECUTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// How to run a tool call. Derived contexts always get a fresh [`ExecutionId`].
#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    working_directory: Option<PathBuf>,
    environment: HashMap<String, String>,
    timeout: Duration,
    execution_id: ExecutionId,
    parent_execution_id: Option<ExecutionId>,
    max_retries: u32,
    current_retry: u32,
    dry_run: bool,
    metadata: Metadata,
}

impl Default for ToolExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutionContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            working_directory: None,
            environment: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            execution_id: ExecutionId::next(),
            parent_execution_id: None,
            max_retries: DEFAULT_MAX_RETRIES,
            current_retry: 0,
            dry_run: false,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    #[must_use]
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    #[must_use]
    pub fn parent_execution_id(&self) -> Option<ExecutionId> {
        self.parent_execution_id
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn current_retry(&self) -> u32 {
        self.current_retry
    }

    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.current_retry < self.max_retries
    }

    /// Context for a nested call: parent is this execution, retry counter starts over.
    #[must_use]
    pub fn create_child_context(&self) -> Self {
        Self {
            execution_id: ExecutionId::next(),
            parent_execution_id: Some(self.execution_id),
            current_retry: 0,
            ..self.clone()
        }
    }

    /// Context for the next attempt of the same call.
    #[must_use]
    pub fn create_retry_context(&self) -> Self {
        Self {
            execution_id: ExecutionId::next(),
            current_retry: self.current_retry + 1,
            ..self.clone()
        }
    }

    /// The narrowed view handed to tool implementations.
    #[must_use]
    pub fn to_basic_context(&self) -> ToolContext {
        let mut metadata = self.metadata.clone();
        metadata.insert("executionId".into(), self.execution_id.to_string());
        ToolContext {
            working_directory: self.working_directory.clone(),
            environment: self.environment.clone(),
            timeout: self.timeout,
            metadata,
        }
    }
}

/// Execution context as seen by a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub timeout: Duration,
    pub metadata: Metadata,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_directory: None,
            environment: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            metadata: Metadata::new(),
        }
    }
}

impl ToolContext {
    /// Resolve `path` against the working directory, falling back to the process cwd.
    #[must_use]
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.working_directory {
            Some(dir) => dir.join(path),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(path),
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
