//! Tools that inspect and control background shell sessions.

use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::context::ToolContext;
use crate::executor::{
    Tool, ToolError, ToolFuture, ToolParams, ToolResult, deserialize_params, truncate_tool_output,
};
use crate::registry::ToolDef;
use crate::shell::{ManagedSession, ShellSessionManager};

fn default_max_wait_seconds() -> u64 {
    60
}

fn default_wait_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadProcessParams {
    /// Session id returned when the process was started
    session_id: String,
    /// Wait for the process to exit before reading
    #[serde(default)]
    wait: bool,
    /// Upper bound on the wait, in seconds
    #[serde(default = "default_max_wait_seconds")]
    max_wait_seconds: u64,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WaitProcessParams {
    /// Session id returned when the process was started
    session_id: String,
    /// How long to wait for the process to exit
    #[serde(default = "default_wait_timeout_ms")]
    timeout_ms: u64,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct KillProcessParams {
    /// Session id returned when the process was started
    session_id: String,
}

fn lookup(
    sessions: &ShellSessionManager,
    session_id: &str,
) -> Result<Arc<ManagedSession>, ToolError> {
    sessions
        .get_session(session_id)
        .ok_or_else(|| ToolError::SessionNotFound {
            session_id: session_id.to_owned(),
        })
}

fn clean_output(session: &ManagedSession) -> String {
    truncate_tool_output(&kestrel_diff::strip_and_normalize(
        &session.output().combined(),
    ))
}

fn with_session_metadata(result: ToolResult, session: &ManagedSession) -> ToolResult {
    let mut result = result
        .with_metadata("session_id", session.session_id())
        .with_metadata("command", session.command())
        .with_metadata("is_running", session.is_running())
        .with_metadata("execution_time_ms", session.elapsed().as_millis());
    if let Some(code) = session.exit_code() {
        result = result.with_metadata("exit_code", code);
    }
    result
}

fn exited(session: &ManagedSession, exit_code: i32) -> ToolResult {
    let message = format!(
        "Process exited with code {exit_code}:\n{}",
        clean_output(session)
    );
    if exit_code == 0 {
        ToolResult::success(message)
    } else {
        ToolResult::error(message)
    }
}

/// `read-process`: current output of a session, optionally after waiting for it to exit.
#[derive(Debug)]
pub struct ReadProcessTool {
    sessions: Arc<ShellSessionManager>,
}

impl ReadProcessTool {
    #[must_use]
    pub fn new(sessions: Arc<ShellSessionManager>) -> Self {
        Self { sessions }
    }

    async fn run(&self, params: ReadProcessParams, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let session = lookup(&self.sessions, &params.session_id)?;
        if params.wait && session.is_running() {
            let limit = Duration::from_secs(params.max_wait_seconds).min(context.timeout);
            session.wait(limit).await;
        }

        let result = match session.exit_code() {
            Some(code) => exited(&session, code),
            None => ToolResult::success(format!(
                "Process is still running.\n\nOutput so far:\n{}",
                clean_output(&session)
            )),
        };
        Ok(with_session_metadata(result, &session))
    }
}

impl Tool for ReadProcessTool {
    fn name(&self) -> &str {
        "read-process"
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "read-process",
            description: "Read the output of a background process started by the shell tool.",
            schema: schemars::schema_for!(ReadProcessParams),
        }
    }

    fn execute<'a>(&'a self, params: &'a ToolParams, context: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move { self.run(deserialize_params(params)?, context).await })
    }
}

/// `wait-process`: block until a session exits, then forget it.
#[derive(Debug)]
pub struct WaitProcessTool {
    sessions: Arc<ShellSessionManager>,
}

impl WaitProcessTool {
    #[must_use]
    pub fn new(sessions: Arc<ShellSessionManager>) -> Self {
        Self { sessions }
    }

    async fn run(&self, params: WaitProcessParams, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let session = lookup(&self.sessions, &params.session_id)?;
        let limit = Duration::from_millis(params.timeout_ms).min(context.timeout);

        let Some(code) = session.wait(limit).await else {
            let message = format!(
                "Process still running after {}ms.\n\nOutput so far:\n{}",
                limit.as_millis(),
                clean_output(&session)
            );
            let pending = ToolResult::pending(
                session.session_id(),
                "wait-process",
                session.command(),
                message,
            );
            return Ok(with_session_metadata(pending, &session));
        };

        self.sessions.remove_session(session.session_id());
        Ok(with_session_metadata(exited(&session, code), &session))
    }
}

impl Tool for WaitProcessTool {
    fn name(&self) -> &str {
        "wait-process"
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "wait-process",
            description: "Wait for a background process to exit and return its output.",
            schema: schemars::schema_for!(WaitProcessParams),
        }
    }

    fn execute<'a>(&'a self, params: &'a ToolParams, context: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move { self.run(deserialize_params(params)?, context).await })
    }
}

/// `kill-process`: terminate a session and forget it.
#[derive(Debug)]
pub struct KillProcessTool {
    sessions: Arc<ShellSessionManager>,
}

impl KillProcessTool {
    #[must_use]
    pub fn new(sessions: Arc<ShellSessionManager>) -> Self {
        Self { sessions }
    }

    fn run(&self, params: &KillProcessParams) -> Result<ToolResult, ToolError> {
        let session = lookup(&self.sessions, &params.session_id)?;
        let was_running = session.is_running();

        if was_running && !session.kill() {
            return Err(ToolError::Failed(format!(
                "Failed to terminate process {}",
                session.session_id()
            )));
        }
        self.sessions.remove_session(session.session_id());

        let result = if was_running {
            ToolResult::success(format!(
                "Process terminated successfully.\n\nFinal output:\n{}",
                clean_output(&session)
            ))
        } else {
            ToolResult::success(format!(
                "Process was already completed.\n\nOutput:\n{}",
                clean_output(&session)
            ))
        };
        Ok(with_session_metadata(result, &session)
            .with_metadata("was_running", was_running)
            .with_metadata("killed", was_running))
    }
}

impl Tool for KillProcessTool {
    fn name(&self) -> &str {
        "kill-process"
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "kill-process",
            description: "Terminate a background process started by the shell tool.",
            schema: schemars::schema_for!(KillProcessParams),
        }
    }

    fn execute<'a>(&'a self, params: &'a ToolParams, _context: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let params: KillProcessParams = deserialize_params(params)?;
            self.run(&params)
        })
    }
}
