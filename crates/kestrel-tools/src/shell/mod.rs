//! Shell command execution: one-shot buffered runs and tracked background sessions.

mod live;
mod session;
mod tool;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

pub use live::LiveShellSession;
pub use session::{ManagedSession, OutputBuffer, ProcessHandle, ShellSessionManager};
pub use tool::ShellTool;

use crate::config::ShellConfig;
use crate::executor::ToolError;
use live::{ShellInvocation, SpawnRequest};

const DEFAULT_BLOCKED: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "sudo",
    "mkfs",
    "dd if=",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "fdisk",
    "parted",
    "iptables",
    "ufw ",
    "firewall-cmd",
];

/// Classic bash fork bomb with all whitespace removed.
const FORK_BOMB: &str = ":(){:|:&};:";

#[cfg(windows)]
const DEFAULT_SHELL: &str = "cmd.exe";
#[cfg(not(windows))]
const DEFAULT_SHELL: &str = "bash";

/// Per-invocation settings.
#[derive(Debug, Clone)]
pub struct ShellExecutionConfig {
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub timeout: Duration,
    /// Overrides the executor's shell.
    pub shell: Option<String>,
}

impl Default for ShellExecutionConfig {
    fn default() -> Self {
        Self {
            working_directory: None,
            environment: HashMap::new(),
            timeout: Duration::from_secs(30),
            shell: None,
        }
    }
}

/// Outcome of a buffered run.
#[derive(Debug, Clone)]
pub struct ShellResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub working_directory: Option<PathBuf>,
    pub duration: Duration,
}

impl ShellResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell commands after a deny-list check.
///
/// The deny-list is a best-effort guard against obviously destructive commands. It is trivially
/// bypassed and is not a security boundary; policy and sandboxing live elsewhere.
#[derive(Debug)]
pub struct ShellExecutor {
    timeout: Duration,
    blocked_commands: Vec<String>,
    shell: String,
    pty: bool,
}

impl ShellExecutor {
    #[must_use]
    pub fn new(config: &ShellConfig) -> Self {
        let allowed: Vec<String> = config
            .allowed_commands
            .iter()
            .map(|s| s.to_lowercase())
            .collect();

        let mut blocked: Vec<String> = DEFAULT_BLOCKED
            .iter()
            .filter(|s| !allowed.contains(&s.to_lowercase()))
            .map(|s| (*s).to_owned())
            .collect();
        blocked.extend(config.blocked_commands.iter().map(|s| s.to_lowercase()));
        blocked.sort();
        blocked.dedup();

        Self {
            timeout: Duration::from_secs(config.timeout),
            blocked_commands: blocked,
            shell: config
                .shell
                .clone()
                .unwrap_or_else(|| DEFAULT_SHELL.to_owned()),
            pty: config.pty,
        }
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Whether sessions started by this executor stream through a pseudo-terminal.
    #[must_use]
    pub fn supports_live_execution(&self) -> bool {
        self.pty && cfg!(unix)
    }

    /// Reject commands matching the deny-list.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::Blocked` naming the matched entry.
    pub fn validate_command(&self, command: &str) -> Result<(), ToolError> {
        if let Some(blocked) = self.find_blocked_command(command) {
            tracing::warn!(command, blocked, "command rejected by deny-list");
            return Err(ToolError::Blocked {
                command: blocked.to_owned(),
            });
        }
        Ok(())
    }

    fn find_blocked_command(&self, command: &str) -> Option<&str> {
        let normalized = command.to_lowercase();
        let compact: String = normalized.split_whitespace().collect();
        if compact.contains(FORK_BOMB) {
            return Some(FORK_BOMB);
        }
        self.blocked_commands
            .iter()
            .find(|blocked| normalized.contains(blocked.as_str()))
            .map(String::as_str)
    }

    fn invocation(&self, shell: Option<&str>) -> ShellInvocation {
        ShellInvocation::for_shell(shell.unwrap_or(&self.shell))
    }

    /// Run `command` to completion with buffered output.
    ///
    /// # Errors
    ///
    /// `Blocked` for deny-listed commands, `Timeout` when `config.timeout` elapses (the process
    /// is killed), `Execution` when the shell cannot be spawned.
    pub async fn execute(
        &self,
        command: &str,
        config: &ShellExecutionConfig,
    ) -> Result<ShellResult, ToolError> {
        self.validate_command(command)?;
        let invocation = self.invocation(config.shell.as_deref());

        let mut cmd = Command::new(&invocation.program);
        cmd.arg(invocation.flag)
            .arg(command)
            .envs(&config.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_directory {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let child = cmd.spawn()?;
        // dropping the timed-out future drops the child, which kills it
        let Ok(output) = tokio::time::timeout(config.timeout, child.wait_with_output()).await
        else {
            tracing::warn!(command, timeout = ?config.timeout, "shell command timed out");
            return Err(ToolError::Timeout {
                timeout_ms: u64::try_from(config.timeout.as_millis()).unwrap_or(u64::MAX),
            });
        };
        let output = output?;

        Ok(ShellResult {
            command: command.to_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            working_directory: config.working_directory.clone(),
            duration: start.elapsed(),
        })
    }

    /// Start `command` as a tracked session without waiting for it.
    ///
    /// Uses a pseudo-terminal when [`supports_live_execution`](Self::supports_live_execution)
    /// holds and the terminal can be opened; otherwise falls back to piped capture and reports
    /// `is_live_supported() == false`.
    ///
    /// # Errors
    ///
    /// `Blocked` for deny-listed commands, `Execution` when the shell cannot be spawned.
    pub fn start_session(
        &self,
        command: &str,
        config: &ShellExecutionConfig,
    ) -> Result<LiveShellSession, ToolError> {
        self.validate_command(command)?;
        let request = SpawnRequest {
            session_id: uuid::Uuid::new_v4().to_string(),
            command,
            invocation: self.invocation(config.shell.as_deref()),
            working_directory: config.working_directory.as_ref(),
            environment: &config.environment,
        };

        if self.supports_live_execution() {
            match live::spawn_pty(&request) {
                Ok(session) => return Ok(LiveShellSession::new(session.into(), true)),
                Err(e) => tracing::warn!("pty unavailable, using pipes: {e}"),
            }
        }
        let session = live::spawn_piped(&request)?;
        Ok(LiveShellSession::new(session.into(), false))
    }
}
