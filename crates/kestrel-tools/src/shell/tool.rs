use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;

use super::{ManagedSession, ShellExecutionConfig, ShellExecutor, ShellSessionManager};
use crate::context::ToolContext;
use crate::executor::{
    Tool, ToolError, ToolFuture, ToolParams, ToolResult, deserialize_params, truncate_tool_output,
};
use crate::registry::ToolDef;

const PARTIAL_OUTPUT_CHARS: usize = 500;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ShellParams {
    /// Command line passed to the shell
    #[serde(alias = "cmd")]
    command: String,
    /// Directory to run in, relative to the session working directory
    #[serde(default)]
    working_directory: Option<String>,
    /// Extra environment variables
    #[serde(default)]
    environment: HashMap<String, String>,
    /// Upper bound on how long to wait for completion
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// Wait for the command to finish. When false the command keeps running in the background.
    #[serde(default = "default_true")]
    wait: bool,
    /// Shell binary overriding the configured one
    #[serde(default)]
    shell: Option<String>,
}

/// The `shell` tool: runs a command synchronously, as a waited live session, or in the
/// background.
#[derive(Debug)]
pub struct ShellTool {
    executor: Arc<ShellExecutor>,
    sessions: Arc<ShellSessionManager>,
}

impl ShellTool {
    #[must_use]
    pub fn new(executor: Arc<ShellExecutor>, sessions: Arc<ShellSessionManager>) -> Self {
        Self { executor, sessions }
    }

    fn execution_config(
        &self,
        params: &ShellParams,
        context: &ToolContext,
    ) -> ShellExecutionConfig {
        let working_directory = params
            .working_directory
            .as_deref()
            .map(|dir| context.resolve_path(Path::new(dir)))
            .or_else(|| context.working_directory.clone());
        let mut environment = context.environment.clone();
        environment.extend(params.environment.clone());
        let timeout = params
            .timeout_ms
            .map_or(self.executor.default_timeout(), Duration::from_millis)
            .min(context.timeout);

        ShellExecutionConfig {
            working_directory,
            environment,
            timeout,
            shell: params.shell.clone(),
        }
    }

    fn shell_name<'a>(&'a self, params: &'a ShellParams) -> &'a str {
        params.shell.as_deref().unwrap_or(self.executor.shell())
    }

    async fn run(&self, params: ShellParams, context: &ToolContext) -> Result<ToolResult, ToolError> {
        if params.command.trim().is_empty() {
            return Err(ToolError::InvalidParams {
                message: "Shell command cannot be empty".into(),
            });
        }
        let config = self.execution_config(&params, context);

        if !params.wait {
            let live = self.executor.start_session(&params.command, &config)?;
            self.sessions.track(Arc::clone(live.managed()));
            let session_id = live.session_id().to_owned();
            let message = format!(
                "Process started in background. Use read-process, wait-process, or kill-process \
                 with session_id: {session_id}"
            );
            return Ok(
                ToolResult::pending(&session_id, "shell", &params.command, message)
                    .with_metadata("sessionId", &session_id)
                    .with_metadata("isLiveSession", live.is_live_supported())
                    .with_metadata("mode", "background"),
            );
        }

        if self.executor.supports_live_execution() {
            return self.run_live(&params, &config).await;
        }

        let result = self.executor.execute(&params.command, &config).await?;
        let output = format_output(&result.stdout, &result.stderr);
        Ok(exit_result(result.exit_code, &output)
            .with_metadata("exit_code", result.exit_code)
            .with_metadata("execution_time_ms", result.duration.as_millis())
            .with_metadata("shell", self.shell_name(&params))
            .with_metadata("isLiveSession", false))
    }

    async fn run_live(
        &self,
        params: &ShellParams,
        config: &ShellExecutionConfig,
    ) -> Result<ToolResult, ToolError> {
        let live = self.executor.start_session(&params.command, config)?;
        let session = Arc::clone(live.managed());
        self.sessions.track(Arc::clone(&session));

        let exit_code = match live.wait_for_completion(config.timeout).await {
            Ok(code) => Some(code),
            // pty could not be opened and the session fell back to pipes
            Err(ToolError::NotSupported(_)) => session.wait(config.timeout).await,
            Err(ToolError::Timeout { .. }) => None,
            Err(e) => return Err(e),
        };

        let Some(exit_code) = exit_code else {
            return Ok(self.still_running(&session, params, config.timeout, live.is_live_supported()));
        };

        self.sessions.remove_session(session.session_id());
        let output = kestrel_diff::strip_and_normalize(&session.output().combined());
        Ok(exit_result(exit_code, &truncate_tool_output(&output))
            .with_metadata("exit_code", exit_code)
            .with_metadata("execution_time_ms", session.elapsed().as_millis())
            .with_metadata("shell", self.shell_name(params))
            .with_metadata("sessionId", session.session_id())
            .with_metadata("isLiveSession", live.is_live_supported()))
    }

    fn still_running(
        &self,
        session: &ManagedSession,
        params: &ShellParams,
        timeout: Duration,
        live_supported: bool,
    ) -> ToolResult {
        let session_id = session.session_id();
        tracing::info!(session_id, ?timeout, "command still running, left in background");
        let partial: String = kestrel_diff::strip_and_normalize(&session.output().combined())
            .chars()
            .take(PARTIAL_OUTPUT_CHARS)
            .collect();
        let message = format!(
            "Command still running after {}ms. Use read-process, wait-process, or kill-process \
             with session_id: {session_id}\n\nPartial output:\n{partial}",
            timeout.as_millis()
        );
        ToolResult::pending(session_id, "shell", &params.command, message)
            .with_metadata("sessionId", session_id)
            .with_metadata("isLiveSession", live_supported)
            .with_metadata("shell", self.shell_name(params))
            .with_metadata("mode", "timeout")
    }
}

fn format_output(stdout: &str, stderr: &str) -> String {
    let combined = if stderr.is_empty() {
        stdout.to_owned()
    } else if stdout.is_empty() {
        stderr.to_owned()
    } else {
        format!("{}\n{stderr}", stdout.trim_end())
    };
    truncate_tool_output(&kestrel_diff::strip_and_normalize(&combined))
}

fn exit_result(exit_code: i32, output: &str) -> ToolResult {
    if exit_code == 0 {
        let output = output.trim_end();
        ToolResult::success(if output.is_empty() {
            "(no output)"
        } else {
            output
        })
    } else {
        ToolResult::error(format!("Command failed with exit code {exit_code}:\n{output}"))
    }
}

impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "shell",
            description: "Execute a shell command. Set wait=false to keep it running in the background and manage it with the process tools.",
            schema: schemars::schema_for!(ShellParams),
        }
    }

    fn execute<'a>(&'a self, params: &'a ToolParams, context: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let params: ShellParams = deserialize_params(params)?;
            self.run(params, context).await
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::ShellConfig;

    fn tool(pty: bool) -> (ShellTool, Arc<ShellSessionManager>) {
        let executor = Arc::new(ShellExecutor::new(&ShellConfig {
            pty,
            ..ShellConfig::default()
        }));
        let sessions = Arc::new(ShellSessionManager::new());
        (ShellTool::new(executor, Arc::clone(&sessions)), sessions)
    }

    fn params(value: serde_json::Value) -> ToolParams {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn empty_command_is_invalid() {
        let (tool, _) = tool(false);
        let err = tool
            .execute(&params(json!({"command": "   "})), &ToolContext::default())
            .await
            .unwrap_err();
        match err {
            ToolError::InvalidParams { message } => {
                assert_eq!(message, "Shell command cannot be empty");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_command_is_invalid() {
        let (tool, _) = tool(false);
        let err = tool
            .execute(&params(json!({})), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn blocked_command_is_rejected() {
        let (tool, sessions) = tool(false);
        let err = tool
            .execute(&params(json!({"command": "sudo rm x"})), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Blocked { .. }));
        assert!(sessions.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn synchronous_success_strips_ansi() {
        let (tool, _) = tool(false);
        let result = tool
            .execute(
                &params(json!({"cmd": "printf '\\033[32mgreen\\033[0m\\n'"})),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.text(), "green");
        assert_eq!(result.metadata()["exit_code"], "0");
        assert_eq!(result.metadata()["isLiveSession"], "false");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn synchronous_failure_reports_exit_code() {
        let (tool, _) = tool(false);
        let result = tool
            .execute(&params(json!({"command": "echo bad >&2; exit 2"})), &ToolContext::default())
            .await
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(result.text(), "Command failed with exit code 2:\nbad\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_output_placeholder() {
        let (tool, _) = tool(false);
        let result = tool
            .execute(&params(json!({"command": "true"})), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result.text(), "(no output)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn context_environment_reaches_command() {
        let (tool, _) = tool(false);
        let context = ToolContext {
            environment: HashMap::from([("FROM_CONTEXT".to_owned(), "ctx".to_owned())]),
            ..ToolContext::default()
        };
        let result = tool
            .execute(
                &params(json!({
                    "command": "echo $FROM_CONTEXT-$FROM_PARAMS",
                    "environment": {"FROM_PARAMS": "param"}
                })),
                &context,
            )
            .await
            .unwrap();
        assert_eq!(result.text(), "ctx-param");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_mode_registers_session() {
        let (tool, sessions) = tool(false);
        let result = tool
            .execute(
                &params(json!({"command": "sleep 30", "wait": false})),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        let ToolResult::Pending {
            session_id,
            tool_name,
            message,
            ..
        } = &result
        else {
            panic!("expected pending, got {result:?}");
        };
        assert_eq!(tool_name, "shell");
        assert!(message.contains(session_id.as_str()));
        assert_eq!(result.metadata()["mode"], "background");

        let session = sessions.get_session(session_id).unwrap();
        assert!(session.is_running());
        sessions.clear_all();
        assert!(!session.is_running());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn live_wait_completes_and_removes_session() {
        let (tool, sessions) = tool(true);
        let result = tool
            .execute(&params(json!({"command": "echo live"})), &ToolContext::default())
            .await
            .unwrap();
        assert!(result.is_success(), "{result:?}");
        assert!(result.text().contains("live"));
        assert!(result.metadata().contains_key("sessionId"));
        assert!(sessions.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn live_wait_timeout_leaves_process_running() {
        let (tool, sessions) = tool(true);
        let result = tool
            .execute(
                &params(json!({"command": "echo started; sleep 30", "timeout_ms": 300})),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        let ToolResult::Pending { session_id, .. } = &result else {
            panic!("expected pending, got {result:?}");
        };
        assert_eq!(result.metadata()["mode"], "timeout");
        let session = sessions.get_session(session_id).unwrap();
        assert!(session.is_running());
        assert!(session.kill());
    }

    #[test]
    fn schema_lists_parameters() {
        let (tool, _) = tool(false);
        let schema = serde_json::to_value(tool.definition().schema).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        assert!(properties.contains_key("command"));
        assert!(properties.contains_key("wait"));
    }
}
