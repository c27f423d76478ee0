use serde::Deserialize;

use crate::policy::PermissionsConfig;

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_orchestrator_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_audit_destination() -> String {
    "stdout".into()
}

/// Top-level configuration for tool execution.
#[derive(Debug, Default, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub files: FileConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub permissions: Option<PermissionsConfig>,
}

/// Shell-specific configuration: timeout, command blocklist, and allowlist overrides.
#[derive(Debug, Deserialize)]
pub struct ShellConfig {
    /// Seconds allowed for synchronous execution.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub shell: Option<String>,
    /// Run sessions on a pseudo-terminal where the platform has one.
    #[serde(default = "default_true")]
    pub pty: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            blocked_commands: Vec::new(),
            allowed_commands: Vec::new(),
            shell: None,
            pty: true,
        }
    }
}

/// Sandbox roots for the file tools. Empty means the process working directory.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_orchestrator_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_orchestrator_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Audit trail of terminal tool executions.
#[derive(Debug, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `"stdout"` logs to the `audit` tracing target; anything else is a file path.
    #[serde(default = "default_audit_destination")]
    pub destination: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: default_audit_destination(),
        }
    }
}
