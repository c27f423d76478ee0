//! Streaming sessions backed by a pseudo-terminal, with a piped fallback.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{Child as PtyChild, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use super::session::{ManagedSession, OutputBuffer, ProcessHandle};
use crate::executor::ToolError;

/// A started shell command plus how its output is being captured.
#[derive(Debug)]
pub struct LiveShellSession {
    session: Arc<ManagedSession>,
    live_supported: bool,
}

impl LiveShellSession {
    #[must_use]
    pub fn new(session: Arc<ManagedSession>, live_supported: bool) -> Self {
        Self {
            session,
            live_supported,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    #[must_use]
    pub fn command(&self) -> &str {
        self.session.command()
    }

    #[must_use]
    pub fn working_directory(&self) -> Option<&Path> {
        self.session.working_directory()
    }

    /// `true` when output streams from a pseudo-terminal.
    #[must_use]
    pub fn is_live_supported(&self) -> bool {
        self.live_supported
    }

    #[must_use]
    pub fn managed(&self) -> &Arc<ManagedSession> {
        &self.session
    }

    pub fn append_stdout(&self, chunk: &str) {
        self.session.output().append_stdout(chunk);
    }

    pub fn append_stderr(&self, chunk: &str) {
        self.session.output().append_stderr(chunk);
    }

    #[must_use]
    pub fn stdout(&self) -> String {
        self.session.output().stdout()
    }

    #[must_use]
    pub fn stderr(&self) -> String {
        self.session.output().stderr()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn kill(&self) -> bool {
        self.session.kill()
    }

    /// Wait for the streamed process to exit.
    ///
    /// # Errors
    ///
    /// `NotSupported` for buffered sessions, `Timeout` when the process is still running after
    /// `timeout`. The process is left running on timeout.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<i32, ToolError> {
        if !self.live_supported {
            return Err(ToolError::NotSupported(
                "live output streaming is not available for this session".into(),
            ));
        }
        self.session
            .wait(timeout)
            .await
            .ok_or_else(|| ToolError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
    }
}

/// Program and flag used to hand a command line to a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShellInvocation {
    pub program: String,
    pub flag: &'static str,
}

impl ShellInvocation {
    pub(crate) fn for_shell(shell: &str) -> Self {
        let name = Path::new(shell)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(shell)
            .to_lowercase();
        let flag = match name.as_str() {
            "cmd" => "/C",
            "powershell" | "pwsh" => "-Command",
            _ => "-c",
        };
        Self {
            program: shell.to_owned(),
            flag,
        }
    }
}

/// Everything needed to start one process.
#[derive(Debug)]
pub(crate) struct SpawnRequest<'a> {
    pub session_id: String,
    pub command: &'a str,
    pub invocation: ShellInvocation,
    pub working_directory: Option<&'a PathBuf>,
    pub environment: &'a HashMap<String, String>,
}

#[derive(Debug)]
struct ChildHandle {
    child: Mutex<tokio::process::Child>,
    pid: Option<u32>,
    killed: AtomicBool,
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit_code(&self) -> Option<i32> {
        if self.killed.load(Ordering::Acquire) {
            return Some(-1);
        }
        let mut child = self
            .child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("failed to poll child process: {e}");
                Some(-1)
            }
        }
    }

    fn kill(&self) -> io::Result<()> {
        self.child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .start_kill()?;
        self.killed.store(true, Ordering::Release);
        Ok(())
    }
}

struct PtyHandle {
    child: Mutex<Box<dyn PtyChild + Send + Sync>>,
    pid: Option<u32>,
    killed: AtomicBool,
    // dropping the master closes the terminal
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.pid)
            .field("killed", &self.killed)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle for PtyHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit_code(&self) -> Option<i32> {
        if self.killed.load(Ordering::Acquire) {
            return Some(-1);
        }
        let mut child = self
            .child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match child.try_wait() {
            Ok(Some(status)) => Some(i32::try_from(status.exit_code()).unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("failed to poll pty child: {e}");
                Some(-1)
            }
        }
    }

    fn kill(&self) -> io::Result<()> {
        self.child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .kill()?;
        self.killed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Start `request` with piped stdout/stderr. Output is appended line by line as it arrives.
pub(crate) fn spawn_piped(request: &SpawnRequest<'_>) -> Result<ManagedSession, ToolError> {
    let mut cmd = Command::new(&request.invocation.program);
    cmd.arg(request.invocation.flag)
        .arg(request.command)
        .envs(request.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = request.working_directory {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn()?;
    let output = Arc::new(OutputBuffer::new());
    if let Some(stdout) = child.stdout.take() {
        output.attach_reader(spawn_line_reader(stdout, Arc::clone(&output), false));
    }
    if let Some(stderr) = child.stderr.take() {
        output.attach_reader(spawn_line_reader(stderr, Arc::clone(&output), true));
    }

    let pid = child.id();
    tracing::info!(session_id = %request.session_id, ?pid, "piped session started");
    let handle = ChildHandle {
        child: Mutex::new(child),
        pid,
        killed: AtomicBool::new(false),
    };
    Ok(ManagedSession::new(
        request.session_id.clone(),
        request.command,
        request.working_directory.cloned(),
        Some(Box::new(handle)),
    )
    .with_output(output))
}

fn spawn_line_reader<R>(
    stream: R,
    output: Arc<OutputBuffer>,
    is_stderr: bool,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    if is_stderr {
                        output.append_stderr(&line);
                    } else {
                        output.append_stdout(&line);
                    }
                    buf.clear();
                }
                Err(e) => {
                    tracing::debug!("output reader stopped: {e}");
                    break;
                }
            }
        }
    })
}

/// Start `request` on a pseudo-terminal. Stdout and stderr arrive interleaved on one stream.
pub(crate) fn spawn_pty(request: &SpawnRequest<'_>) -> Result<ManagedSession, ToolError> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ToolError::Failed(format!("failed to open pty: {e}")))?;

    let mut builder = CommandBuilder::new(&request.invocation.program);
    builder.arg(request.invocation.flag);
    builder.arg(request.command);
    if let Some(dir) = request.working_directory {
        builder.cwd(dir);
    }
    for (key, value) in request.environment {
        builder.env(key, value);
    }
    if !request.environment.contains_key("TERM") {
        builder.env("TERM", "xterm-256color");
    }

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| ToolError::Failed(format!("failed to spawn on pty: {e}")))?;
    // the child holds its own copy of the slave side
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ToolError::Failed(format!("failed to clone pty reader: {e}")))?;

    let output = Arc::new(OutputBuffer::new());
    let sink = Arc::clone(&output);
    output.attach_reader(tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => sink.append_stdout(&String::from_utf8_lossy(&buf[..n])),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => break,
            }
        }
    }));

    let pid = child.process_id();
    tracing::info!(session_id = %request.session_id, ?pid, "pty session started");
    let handle = PtyHandle {
        child: Mutex::new(child),
        pid,
        killed: AtomicBool::new(false),
        _master: Mutex::new(pair.master),
    };
    Ok(ManagedSession::new(
        request.session_id.clone(),
        request.command,
        request.working_directory.cloned(),
        Some(Box::new(handle)),
    )
    .with_output(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_flags() {
        assert_eq!(ShellInvocation::for_shell("bash").flag, "-c");
        assert_eq!(ShellInvocation::for_shell("/bin/zsh").flag, "-c");
        assert_eq!(ShellInvocation::for_shell("cmd.exe").flag, "/C");
        assert_eq!(ShellInvocation::for_shell("pwsh").flag, "-Command");
        assert_eq!(ShellInvocation::for_shell("powershell.exe").flag, "-Command");
    }

    #[tokio::test]
    async fn buffered_session_reports_unsupported() {
        let session = Arc::new(ManagedSession::new("s", "true", None, None));
        let live = LiveShellSession::new(session, false);
        let err = live
            .wait_for_completion(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotSupported(_)));
    }

    #[cfg(unix)]
    fn request<'a>(command: &'a str, env: &'a HashMap<String, String>) -> SpawnRequest<'a> {
        SpawnRequest {
            session_id: "test".into(),
            command,
            invocation: ShellInvocation::for_shell("sh"),
            working_directory: None,
            environment: env,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn piped_session_captures_both_streams() {
        let env = HashMap::from([("GREETING".to_owned(), "hi".to_owned())]);
        let session = spawn_piped(&request("echo $GREETING; echo oops >&2; exit 3", &env)).unwrap();
        assert_eq!(session.wait(Duration::from_secs(10)).await, Some(3));
        assert_eq!(session.output().stdout(), "hi\n");
        assert_eq!(session.output().stderr(), "oops\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn piped_session_survives_invalid_utf8() {
        let env = HashMap::new();
        let session = spawn_piped(&request(r"printf 'before\n\377\nafter\n'", &env)).unwrap();
        assert_eq!(session.wait(Duration::from_secs(10)).await, Some(0));
        assert_eq!(session.output().stdout(), "before\n\u{FFFD}\nafter\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn piped_session_drains_past_invalid_utf8() {
        let env = HashMap::new();
        let session = spawn_piped(&request(
            r"printf '\377\n'; head -c 300000 /dev/zero | tr '\0' x",
            &env,
        ))
        .unwrap();
        assert_eq!(session.wait(Duration::from_secs(10)).await, Some(0));
        assert_eq!(session.output().stdout().len(), "\u{FFFD}\n".len() + 300_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn piped_session_kill() {
        let env = HashMap::new();
        let session = spawn_piped(&request("sleep 30", &env)).unwrap();
        assert!(session.is_running());
        assert!(session.kill());
        assert!(!session.is_running());
        assert_eq!(session.exit_code(), Some(-1));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn pty_session_streams_output() {
        let env = HashMap::new();
        // some sandboxes have no pty devices
        let Ok(session) = spawn_pty(&request("printf 'pty ok'", &env)) else {
            return;
        };
        let live = LiveShellSession::new(Arc::new(session), true);
        let code = live.wait_for_completion(Duration::from_secs(10)).await.unwrap();
        assert_eq!(code, 0);
        assert!(live.stdout().contains("pty ok"));
    }
}
