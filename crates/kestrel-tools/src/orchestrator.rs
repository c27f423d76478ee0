//! Policy-gated, state-tracked tool execution.
//!
//! Every call walks `Pending → Executing → {Success | Failed}` (or `Pending → Failed` when the
//! policy denies it). Callers never see a raw tool error: failures, panics, timeouts and
//! cancellations all come back as an `Error` shaped [`ToolResult`] with a `Failed` state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditLogger, AuditResult};
use crate::context::{ExecutionId, ToolExecutionContext, unix_millis};
use crate::executor::{Metadata, Tool, ToolCall, ToolError, ToolParams, ToolResult};
use crate::policy::{PolicyDecision, PolicyEngine};
use crate::registry::ToolRegistry;
use crate::render::Renderer;
use crate::state::{StateEventTx, ToolExecutionState, ToolStateManager};

/// Extra time a tool gets past its context timeout before the watchdog aborts it.
const WATCHDOG_GRACE: Duration = Duration::from_secs(1);

/// A [`ToolResult`] bound to timing, retry count and the terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutionResult {
    pub execution_id: ExecutionId,
    pub parent_execution_id: Option<ExecutionId>,
    pub call_id: String,
    pub tool_name: String,
    pub result: ToolResult,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub state: ToolExecutionState,
    pub metadata: Metadata,
}

impl ToolExecutionResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.result.error_message()
    }
}

pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    policy: Arc<dyn PolicyEngine>,
    renderer: Arc<dyn Renderer>,
    states: ToolStateManager,
    audit: Option<AuditLogger>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ToolOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolOrchestrator")
            .field("registry", &self.registry)
            .field("audit", &self.audit.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ToolOrchestrator {
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<dyn PolicyEngine>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            registry,
            policy,
            renderer,
            states: ToolStateManager::new(),
            audit: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Publish every accepted state transition on `tx`.
    #[must_use]
    pub fn with_state_events(mut self, tx: StateEventTx) -> Self {
        self.states = ToolStateManager::new().with_event_tx(tx);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token whose cancellation fails every in-flight and future call.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one tool call. Never fails: every problem is reported in the returned result.
    pub async fn execute_tool_call(
        &self,
        tool_name: &str,
        params: ToolParams,
        context: &ToolExecutionContext,
    ) -> ToolExecutionResult {
        self.execute_call(ToolCall::new(tool_name, params), context)
            .await
    }

    /// Run `calls` strictly in order, each under a child of `context`.
    ///
    /// Every entry runs as a fresh call with its own id, so running the same list again under
    /// a retry context starts new state histories. Results line up with `calls` by position.
    /// A failed call stops the chain only when `context` has no retries left.
    pub async fn execute_tool_chain(
        &self,
        calls: &[ToolCall],
        context: &ToolExecutionContext,
    ) -> Vec<ToolExecutionResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let child = context.create_child_context();
            let attempt = ToolCall::new(call.tool_name.clone(), call.params.clone());
            let result = self.execute_call(attempt, &child).await;
            let failed = !result.is_success();
            results.push(result);

            if self.cancel.is_cancelled() {
                tracing::info!("tool chain cancelled");
                break;
            }
            if failed && !context.can_retry() {
                tracing::warn!(
                    tool = %call.tool_name,
                    remaining = calls.len() - results.len(),
                    "tool chain stopped after failure"
                );
                break;
            }
        }
        results
    }

    #[must_use]
    pub fn get_execution_state(&self, call_id: &str) -> Option<ToolExecutionState> {
        self.states.get_state(call_id)
    }

    #[must_use]
    pub fn all_execution_states(&self) -> HashMap<String, ToolExecutionState> {
        self.states.all_states()
    }

    pub fn clear_history(&self) {
        self.states.clear();
    }

    async fn execute_call(&self, call: ToolCall, context: &ToolExecutionContext) -> ToolExecutionResult {
        let started = Instant::now();
        let start_time_ms = unix_millis();
        self.states.update_state(ToolExecutionState::Pending {
            call_id: call.id.clone(),
            call: call.clone(),
        });

        match self.policy.check_permission(&call, context) {
            PolicyDecision::Deny => {
                tracing::info!(tool = %call.tool_name, "tool call denied by policy");
                let error = ToolError::PolicyDenied {
                    tool: call.tool_name.clone(),
                };
                let result = ToolResult::from_error(
                    format!("Tool execution denied by policy: {}", call.tool_name),
                    &error,
                );
                return self
                    .finish(&call, context, result, started, start_time_ms)
                    .await;
            }
            PolicyDecision::Ask => {
                // confirmation is rendered but not awaited
                tracing::warn!(tool = %call.tool_name, "confirmation requested, proceeding");
                self.renderer
                    .render_user_confirmation_request(&call.tool_name, &call.params);
            }
            PolicyDecision::Allow => {}
        }

        self.states.update_state(ToolExecutionState::Executing {
            call_id: call.id.clone(),
            started_at_ms: unix_millis(),
        });
        tokio::task::yield_now().await;

        let result = if self.cancel.is_cancelled() {
            cancelled_result()
        } else if let Some(tool) = self.registry.get_tool(&call.tool_name) {
            if context.is_dry_run() {
                ToolResult::success(format!("Dry run: {} was not executed", call.tool_name))
                    .with_metadata("dryRun", true)
            } else {
                self.dispatch(tool, &call, context).await
            }
        } else {
            let error = ToolError::ToolNotFound {
                tool: call.tool_name.clone(),
            };
            ToolResult::from_error(format!("Tool not found: {}", call.tool_name), &error)
        };

        let result = match result {
            ToolResult::Pending {
                ref session_id,
                ref command,
                ..
            } => {
                self.renderer
                    .render_live_session(session_id, command, context.working_directory());
                let session_id = session_id.clone();
                result
                    .with_metadata("isAsync", true)
                    .with_metadata("sessionId", session_id)
            }
            other => other,
        };

        self.finish(&call, context, result, started, start_time_ms)
            .await
    }

    /// Run the tool on its own task, bounded by the context timeout and the cancellation token.
    async fn dispatch(
        &self,
        tool: Arc<dyn Tool>,
        call: &ToolCall,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        let params = call.params.clone();
        let basic = context.to_basic_context();
        let handle = tokio::spawn(async move { tool.execute(&params, &basic).await });
        let abort = handle.abort_handle();
        let limit = context.timeout() + WATCHDOG_GRACE;

        let joined = tokio::select! {
            joined = tokio::time::timeout(limit, handle) => joined,
            () = self.cancel.cancelled() => {
                abort.abort();
                tracing::info!(tool = %call.tool_name, "tool execution cancelled");
                return cancelled_result();
            }
        };

        match joined {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(error))) => failure(&error),
            Ok(Err(join_error)) => {
                tracing::error!(tool = %call.tool_name, "tool task failed: {join_error}");
                let reason = if join_error.is_panic() {
                    "tool panicked"
                } else {
                    "tool task aborted"
                };
                failure(&ToolError::Failed(reason.into()))
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(tool = %call.tool_name, ?limit, "tool execution timed out");
                failure(&ToolError::Timeout {
                    timeout_ms: u64::try_from(context.timeout().as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    async fn finish(
        &self,
        call: &ToolCall,
        context: &ToolExecutionContext,
        result: ToolResult,
        started: Instant,
        start_time_ms: u64,
    ) -> ToolExecutionResult {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let state = if result.is_success() {
            ToolExecutionState::Success {
                call_id: call.id.clone(),
                result: result.clone(),
                duration_ms,
            }
        } else {
            ToolExecutionState::Failed {
                call_id: call.id.clone(),
                error: result.text().to_owned(),
                duration_ms,
            }
        };
        self.states.update_state(state.clone());

        if let Some(audit) = &self.audit {
            audit
                .log(&AuditEntry {
                    timestamp: start_time_ms.to_string(),
                    tool: call.tool_name.clone(),
                    execution_id: context.execution_id().to_string(),
                    call_id: call.id.clone(),
                    input: serde_json::to_string(&call.params).unwrap_or_default(),
                    result: AuditResult::from(&result),
                    duration_ms,
                })
                .await;
        }

        let mut metadata = context.metadata().clone();
        if let Some(parent) = context.parent_execution_id() {
            metadata.insert("parentExecutionId".into(), parent.to_string());
        }

        ToolExecutionResult {
            execution_id: context.execution_id(),
            parent_execution_id: context.parent_execution_id(),
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            result,
            start_time_ms,
            end_time_ms: unix_millis(),
            duration_ms,
            retry_count: context.current_retry(),
            state,
            metadata,
        }
    }
}

fn failure(error: &ToolError) -> ToolResult {
    let result = ToolResult::from_error(format!("Tool execution failed: {error}"), error);
    match error {
        ToolError::Timeout { .. } => result.with_metadata("timeout", true),
        ToolError::Cancelled => result.with_metadata("cancelled", true),
        _ => result,
    }
}

fn cancelled_result() -> ToolResult {
    ToolResult::from_error("Tool execution cancelled", &ToolError::Cancelled)
        .with_metadata("cancelled", true)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::context::ToolContext;
    use crate::executor::ToolFuture;
    use crate::registry::ToolDef;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
        Sleep(Duration),
        Background,
        EchoContext,
        FailFirst,
    }

    struct ScriptedTool {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl ScriptedTool {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn definition(&self) -> ToolDef {
            ToolDef {
                name: self.name,
                description: "scripted",
                schema: schemars::json_schema!({"type": "object"}),
            }
        }

        fn execute<'a>(&'a self, _params: &'a ToolParams, context: &'a ToolContext) -> ToolFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match self.behavior {
                    Behavior::Succeed => Ok(ToolResult::success("done")),
                    Behavior::Fail => Err(ToolError::Failed("disk on fire".into())),
                    Behavior::Panic => panic!("tool bug"),
                    Behavior::Sleep(d) => {
                        tokio::time::sleep(d).await;
                        Ok(ToolResult::success("slept"))
                    }
                    Behavior::Background => Ok(ToolResult::pending(
                        "sess-1",
                        self.name,
                        "npm run dev",
                        "started",
                    )),
                    Behavior::EchoContext => Ok(ToolResult::success(
                        context.metadata.get("executionId").cloned().unwrap_or_default(),
                    )),
                    Behavior::FailFirst if self.calls() == 1 => {
                        Err(ToolError::Failed("flaky".into()))
                    }
                    Behavior::FailFirst => Ok(ToolResult::success("recovered")),
                }
            })
        }
    }

    struct FixedPolicy(PolicyDecision);

    impl PolicyEngine for FixedPolicy {
        fn check_permission(&self, _call: &ToolCall, _context: &ToolExecutionContext) -> PolicyDecision {
            self.0
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        events: Mutex<Vec<String>>,
    }

    impl Renderer for RecordingRenderer {
        fn render_user_confirmation_request(&self, tool_name: &str, _params: &ToolParams) {
            self.events.lock().unwrap().push(format!("confirm:{tool_name}"));
        }

        fn render_live_session(&self, session_id: &str, command: &str, _cwd: Option<&Path>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("live:{session_id}:{command}"));
        }
    }

    fn orchestrator(
        tools: &[Arc<ScriptedTool>],
        decision: PolicyDecision,
    ) -> (ToolOrchestrator, Arc<RecordingRenderer>) {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::clone(tool) as Arc<dyn Tool>);
        }
        let renderer = Arc::new(RecordingRenderer::default());
        let orchestrator = ToolOrchestrator::new(
            Arc::new(registry),
            Arc::new(FixedPolicy(decision)),
            Arc::clone(&renderer) as Arc<dyn Renderer>,
        );
        (orchestrator, renderer)
    }

    #[tokio::test]
    async fn allowed_call_succeeds_with_ordered_states() {
        let tool = ScriptedTool::new("ok", Behavior::Succeed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (orchestrator, _) = orchestrator(&[Arc::clone(&tool)], PolicyDecision::Allow);
        let orchestrator = orchestrator.with_state_events(tx);

        let result = orchestrator
            .execute_tool_call("ok", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert!(result.is_success());
        assert_eq!(result.result.text(), "done");
        assert!(matches!(result.state, ToolExecutionState::Success { .. }));

        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state.name());
        }
        assert_eq!(seen, ["pending", "executing", "success"]);
        assert_eq!(
            orchestrator.get_execution_state(&result.call_id),
            Some(result.state.clone())
        );
    }

    #[tokio::test]
    async fn deny_short_circuits_before_dispatch() {
        let tool = ScriptedTool::new("shell", Behavior::Succeed);
        let (orchestrator, _) = orchestrator(&[Arc::clone(&tool)], PolicyDecision::Deny);

        let result = orchestrator
            .execute_tool_call("shell", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert!(!result.is_success());
        assert!(matches!(result.state, ToolExecutionState::Failed { .. }));
        assert_eq!(
            result.error_message(),
            Some("Tool execution denied by policy: shell")
        );
        assert_eq!(tool.calls(), 0);
    }

    #[tokio::test]
    async fn ask_renders_confirmation_and_proceeds() {
        let tool = ScriptedTool::new("ok", Behavior::Succeed);
        let (orchestrator, renderer) = orchestrator(&[Arc::clone(&tool)], PolicyDecision::Ask);

        let result = orchestrator
            .execute_tool_call("ok", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert!(result.is_success());
        assert_eq!(tool.calls(), 1);
        assert_eq!(*renderer.events.lock().unwrap(), ["confirm:ok"]);
    }

    #[tokio::test]
    async fn unknown_tool() {
        let (orchestrator, _) = orchestrator(&[], PolicyDecision::Allow);
        let result = orchestrator
            .execute_tool_call("ghost", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert_eq!(result.error_message(), Some("Tool not found: ghost"));
        assert!(matches!(
            result.result,
            ToolResult::Error { ref error_type, .. } if error_type.as_deref() == Some("tool_not_found")
        ));
    }

    #[tokio::test]
    async fn tool_error_becomes_failed_state() {
        let tool = ScriptedTool::new("bad", Behavior::Fail);
        let (orchestrator, _) = orchestrator(&[tool], PolicyDecision::Allow);
        let result = orchestrator
            .execute_tool_call("bad", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert_eq!(result.error_message(), Some("Tool execution failed: disk on fire"));
        assert!(matches!(
            result.state,
            ToolExecutionState::Failed { ref error, .. } if error == "Tool execution failed: disk on fire"
        ));
    }

    #[tokio::test]
    async fn panicking_tool_is_contained() {
        let tool = ScriptedTool::new("boom", Behavior::Panic);
        let (orchestrator, _) = orchestrator(&[tool], PolicyDecision::Allow);
        let result = orchestrator
            .execute_tool_call("boom", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert_eq!(result.error_message(), Some("Tool execution failed: tool panicked"));
    }

    #[tokio::test]
    async fn watchdog_times_out_slow_tool() {
        let tool = ScriptedTool::new("slow", Behavior::Sleep(Duration::from_secs(30)));
        let (orchestrator, _) = orchestrator(&[tool], PolicyDecision::Allow);
        let context = ToolExecutionContext::new().with_timeout(Duration::from_millis(50));

        let result = orchestrator
            .execute_tool_call("slow", ToolParams::new(), &context)
            .await;
        assert!(!result.is_success());
        assert_eq!(result.result.metadata()["timeout"], "true");
        assert_eq!(
            result.error_message(),
            Some("Tool execution failed: timed out after 50ms")
        );
    }

    #[tokio::test]
    async fn cancelled_before_dispatch() {
        let tool = ScriptedTool::new("ok", Behavior::Succeed);
        let (orchestrator, _) = orchestrator(&[Arc::clone(&tool)], PolicyDecision::Allow);
        orchestrator.cancellation_token().cancel();

        let result = orchestrator
            .execute_tool_call("ok", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert!(!result.is_success());
        assert_eq!(result.result.metadata()["cancelled"], "true");
        assert_eq!(tool.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_while_running() {
        let tool = ScriptedTool::new("slow", Behavior::Sleep(Duration::from_secs(30)));
        let (orchestrator, _) = orchestrator(&[tool], PolicyDecision::Allow);
        let token = CancellationToken::new();
        let orchestrator = orchestrator.with_cancellation(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let result = orchestrator
            .execute_tool_call("slow", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert_eq!(result.error_message(), Some("Tool execution cancelled"));
        assert_eq!(result.result.metadata()["cancelled"], "true");
    }

    #[tokio::test]
    async fn dry_run_skips_dispatch() {
        let tool = ScriptedTool::new("ok", Behavior::Succeed);
        let (orchestrator, _) = orchestrator(&[Arc::clone(&tool)], PolicyDecision::Allow);
        let context = ToolExecutionContext::new().with_dry_run(true);

        let result = orchestrator
            .execute_tool_call("ok", ToolParams::new(), &context)
            .await;
        assert!(result.is_success());
        assert_eq!(result.result.metadata()["dryRun"], "true");
        assert_eq!(tool.calls(), 0);
    }

    #[tokio::test]
    async fn pending_result_is_tagged_async() {
        let tool = ScriptedTool::new("bg", Behavior::Background);
        let (orchestrator, renderer) = orchestrator(&[tool], PolicyDecision::Allow);

        let result = orchestrator
            .execute_tool_call("bg", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        assert!(!result.is_success());
        assert!(matches!(result.state, ToolExecutionState::Failed { .. }));
        assert_eq!(result.result.metadata()["isAsync"], "true");
        assert_eq!(result.result.metadata()["sessionId"], "sess-1");
        assert_eq!(*renderer.events.lock().unwrap(), ["live:sess-1:npm run dev"]);
    }

    #[tokio::test]
    async fn tool_sees_basic_context_with_execution_id() {
        let tool = ScriptedTool::new("echo", Behavior::EchoContext);
        let (orchestrator, _) = orchestrator(&[tool], PolicyDecision::Allow);
        let context = ToolExecutionContext::new();

        let result = orchestrator
            .execute_tool_call("echo", ToolParams::new(), &context)
            .await;
        assert_eq!(result.result.text(), context.execution_id().to_string());
        assert_eq!(result.execution_id, context.execution_id());
    }

    #[tokio::test]
    async fn chain_runs_in_order_under_child_contexts() {
        let first = ScriptedTool::new("first", Behavior::EchoContext);
        let second = ScriptedTool::new("second", Behavior::Fail);
        let third = ScriptedTool::new("third", Behavior::Succeed);
        let (orchestrator, _) = orchestrator(
            &[first, second, Arc::clone(&third)],
            PolicyDecision::Allow,
        );
        let context = ToolExecutionContext::new();
        let calls = [
            ToolCall::new("first", ToolParams::new()),
            ToolCall::new("second", ToolParams::new()),
            ToolCall::new("third", ToolParams::new()),
        ];

        let results = orchestrator.execute_tool_chain(&calls, &context).await;
        let names: Vec<_> = results.iter().map(|r| r.tool_name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
        for (result, call) in results.iter().zip(&calls) {
            assert_ne!(result.call_id, call.id);
            assert_eq!(result.parent_execution_id, Some(context.execution_id()));
            assert_ne!(result.execution_id, context.execution_id());
        }
        assert!(results[0].execution_id < results[1].execution_id);
        assert_eq!(third.calls(), 1);
        assert_eq!(orchestrator.all_execution_states().len(), 3);
        orchestrator.clear_history();
        assert!(orchestrator.all_execution_states().is_empty());
    }

    #[tokio::test]
    async fn chain_stops_when_no_retries_left() {
        let failing = ScriptedTool::new("bad", Behavior::Fail);
        let after = ScriptedTool::new("after", Behavior::Succeed);
        let (orchestrator, _) = orchestrator(&[failing, Arc::clone(&after)], PolicyDecision::Allow);
        let context = ToolExecutionContext::new().with_max_retries(0);
        let calls = [
            ToolCall::new("bad", ToolParams::new()),
            ToolCall::new("after", ToolParams::new()),
        ];

        let results = orchestrator.execute_tool_chain(&calls, &context).await;
        assert_eq!(results.len(), 1);
        assert_eq!(after.calls(), 0);
    }

    #[tokio::test]
    async fn retried_chain_publishes_fresh_states() {
        let flaky = ScriptedTool::new("flaky", Behavior::FailFirst);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (orchestrator, _) = orchestrator(&[Arc::clone(&flaky)], PolicyDecision::Allow);
        let orchestrator = orchestrator.with_state_events(tx);
        let context = ToolExecutionContext::new().with_max_retries(1);
        let calls = [ToolCall::new("flaky", ToolParams::new())];

        let first = orchestrator.execute_tool_chain(&calls, &context).await;
        assert!(!first[0].is_success());

        let retry = context.create_retry_context();
        let second = orchestrator.execute_tool_chain(&calls, &retry).await;
        assert!(second[0].is_success());
        assert_ne!(first[0].call_id, second[0].call_id);
        assert_eq!(flaky.calls(), 2);

        assert!(matches!(
            orchestrator.get_execution_state(&first[0].call_id),
            Some(ToolExecutionState::Failed { .. })
        ));
        assert!(matches!(
            orchestrator.get_execution_state(&second[0].call_id),
            Some(ToolExecutionState::Success { .. })
        ));

        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state.name());
        }
        assert_eq!(
            seen,
            ["pending", "executing", "failed", "pending", "executing", "success"]
        );
    }

    #[tokio::test]
    async fn audit_file_records_terminal_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let audit = AuditLogger::from_config(&crate::config::AuditConfig {
            enabled: true,
            destination: path.display().to_string(),
        })
        .await
        .unwrap();
        let (orchestrator, _) = orchestrator(&[], PolicyDecision::Deny);
        let orchestrator = orchestrator.with_audit(audit);

        orchestrator
            .execute_tool_call("shell", ToolParams::new(), &ToolExecutionContext::new())
            .await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"type\":\"denied\""));
        assert!(content.contains("\"tool\":\"shell\""));
    }
}
