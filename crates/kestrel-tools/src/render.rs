use std::path::Path;

use crate::executor::ToolParams;

/// Notifications for whatever front end hosts the orchestrator. Fire and forget.
pub trait Renderer: Send + Sync {
    fn render_user_confirmation_request(&self, tool_name: &str, params: &ToolParams);

    /// A tool left a process running in the background.
    fn render_live_session(
        &self,
        _session_id: &str,
        _command: &str,
        _working_directory: Option<&Path>,
    ) {
    }
}

/// Renders through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRenderer;

impl Renderer for TracingRenderer {
    fn render_user_confirmation_request(&self, tool_name: &str, params: &ToolParams) {
        let params = serde_json::to_string(params).unwrap_or_default();
        tracing::info!(tool = tool_name, %params, "confirmation requested");
    }

    fn render_live_session(&self, session_id: &str, command: &str, working_directory: Option<&Path>) {
        tracing::info!(
            session_id,
            command,
            cwd = ?working_directory,
            "background session started"
        );
    }
}
