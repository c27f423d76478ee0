use std::path::Path;

use crate::config::AuditConfig;
use crate::executor::ToolResult;

/// JSON-lines trail of terminal tool executions.
#[derive(Debug)]
pub struct AuditLogger {
    destination: AuditDestination,
}

#[derive(Debug)]
enum AuditDestination {
    Stdout,
    File(tokio::sync::Mutex<tokio::fs::File>),
}

#[derive(Debug, serde::Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub tool: String,
    pub execution_id: String,
    pub call_id: String,
    pub input: String,
    pub result: AuditResult,
    pub duration_ms: u64,
}

#[derive(Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Denied { reason: String },
    Error { message: String },
    Timeout,
    Cancelled,
    Pending { session_id: String },
}

impl From<&ToolResult> for AuditResult {
    fn from(result: &ToolResult) -> Self {
        let flagged = |key: &str| result.metadata().get(key).is_some_and(|v| v == "true");
        match result {
            ToolResult::Pending { session_id, .. } => Self::Pending {
                session_id: session_id.clone(),
            },
            ToolResult::Error {
                message,
                error_type,
                ..
            } if error_type.as_deref() == Some("policy_denied") => Self::Denied {
                reason: message.clone(),
            },
            _ if flagged("timeout") => Self::Timeout,
            _ if flagged("cancelled") => Self::Cancelled,
            _ if result.is_success() => Self::Success,
            _ => Self::Error {
                message: result.text().to_owned(),
            },
        }
    }
}

impl AuditLogger {
    /// Create a new `AuditLogger` from config.
    ///
    /// # Errors
    ///
    /// Returns an error if a file destination cannot be opened.
    pub async fn from_config(config: &AuditConfig) -> Result<Self, std::io::Error> {
        let destination = if config.destination == "stdout" {
            AuditDestination::Stdout
        } else {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(&config.destination))
                .await?;
            AuditDestination::File(tokio::sync::Mutex::new(file))
        };

        Ok(Self { destination })
    }

    pub async fn log(&self, entry: &AuditEntry) {
        let Ok(json) = serde_json::to_string(entry) else {
            return;
        };

        match &self.destination {
            AuditDestination::Stdout => {
                tracing::info!(target: "audit", "{json}");
            }
            AuditDestination::File(file) => {
                use tokio::io::AsyncWriteExt;
                let mut f = file.lock().await;
                let line = format!("{json}\n");
                let written = match f.write_all(line.as_bytes()).await {
                    Ok(()) => f.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    tracing::error!("failed to write audit log: {e}");
                }
            }
        }
    }
}
