mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use kestrel_diff::DiffStats;
use kestrel_tools::{
    AllowAll, AuditLogger, FileChange, FileChangeTracker, PermissionPolicy, PolicyEngine,
    ShellSessionManager, ToolCall, ToolDef, ToolExecutionContext, ToolExecutionResult,
    ToolOrchestrator, ToolRegistry, TracingRenderer,
};
use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::config::{Config, resolve_config_path};

/// What a run prints on stdout.
#[derive(Debug, Serialize)]
struct Report {
    /// Tools the permission policy leaves callable, with their parameter schemas.
    tools: Vec<ToolDef>,
    results: Vec<ToolExecutionResult>,
    changes: Vec<ChangeReport>,
    /// Background sessions still running at exit. They are killed before the process ends.
    active_sessions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChangeReport {
    #[serde(flatten)]
    change: FileChange,
    stats: DiffStats,
    diff: String,
}

impl From<FileChange> for ChangeReport {
    fn from(change: FileChange) -> Self {
        Self {
            stats: change.diff_stats(),
            diff: change.unified_diff(),
            change,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load(&resolve_config_path())?;
    init_subscriber(&config.log.filter);

    let calls = read_calls().await?;
    tracing::info!(count = calls.len(), "tool calls received");

    let sessions = Arc::new(ShellSessionManager::new());
    let changes = Arc::new(FileChangeTracker::new());
    changes.add_listener(Arc::new(|change: &FileChange| {
        tracing::info!(path = %change.file_path, kind = ?change.change_type, "file changed");
    }));

    let registry = Arc::new(ToolRegistry::builtin(
        &config.tools,
        Arc::clone(&sessions),
        Arc::clone(&changes),
    ));
    let permissions = config.tools.permissions.clone().map(PermissionPolicy::from);
    let tools = tool_listing(&registry, permissions.as_ref());
    let policy: Arc<dyn PolicyEngine> = match permissions {
        Some(permissions) => Arc::new(permissions),
        None => Arc::new(AllowAll),
    };

    let mut orchestrator = ToolOrchestrator::new(registry, policy, Arc::new(TracingRenderer));
    if config.tools.audit.enabled {
        let audit = AuditLogger::from_config(&config.tools.audit)
            .await
            .with_context(|| format!("failed to open audit log {}", config.tools.audit.destination))?;
        orchestrator = orchestrator.with_audit(audit);
    }

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling tool execution");
            cancel.cancel();
        }
    });

    let context = ToolExecutionContext::new()
        .with_working_directory(std::env::current_dir().context("failed to resolve working directory")?)
        .with_timeout(Duration::from_millis(config.tools.orchestrator.timeout_ms))
        .with_max_retries(config.tools.orchestrator.max_retries);

    let results = orchestrator.execute_tool_chain(&calls, &context).await;
    let failed = results.iter().filter(|r| !r.is_success()).count();

    let report = Report {
        tools,
        results,
        changes: changes
            .get_changes()
            .into_iter()
            .map(ChangeReport::from)
            .collect(),
        active_sessions: sessions
            .active_sessions()
            .iter()
            .map(|s| s.session_id().to_owned())
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    sessions.clear_all();
    tracing::info!(total = calls.len(), failed, "run finished");
    Ok(())
}

fn tool_listing(registry: &ToolRegistry, permissions: Option<&PermissionPolicy>) -> Vec<ToolDef> {
    match permissions {
        Some(policy) => registry.available_definitions(policy),
        None => registry.definitions(),
    }
}

/// Tool calls arrive on stdin as a JSON array.
async fn read_calls() -> anyhow::Result<Vec<ToolCall>> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read stdin")?;
    if input.trim().is_empty() {
        bail!("expected a JSON array of tool calls on stdin");
    }
    serde_json::from_str(&input).context("failed to parse tool calls")
}

fn init_subscriber(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
