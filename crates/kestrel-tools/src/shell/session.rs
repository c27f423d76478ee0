//! Registry of OS processes started by shell tools.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::context::unix_millis;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to let reader tasks drain after the process exits.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Exclusive handle to a spawned process. Liveness is always read from the OS, never cached.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Exit code once the process has exited; `-1` when it was killed or ended by a signal.
    fn try_exit_code(&self) -> Option<i32>;

    fn is_alive(&self) -> bool {
        self.try_exit_code().is_none()
    }

    /// Force-terminate the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the process already exited or the signal could not be delivered.
    fn kill(&self) -> io::Result<()>;
}

#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: String,
    stderr: String,
}

/// Output captured from a session, fed by background reader tasks.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    captured: Mutex<CapturedOutput>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_stdout(&self, chunk: &str) {
        self.lock().stdout.push_str(chunk);
    }

    pub fn append_stderr(&self, chunk: &str) {
        self.lock().stderr.push_str(chunk);
    }

    #[must_use]
    pub fn stdout(&self) -> String {
        self.lock().stdout.clone()
    }

    #[must_use]
    pub fn stderr(&self) -> String {
        self.lock().stderr.clone()
    }

    /// Stdout followed by stderr, separated by a newline when both are present.
    #[must_use]
    pub fn combined(&self) -> String {
        let captured = self.lock();
        match (captured.stdout.is_empty(), captured.stderr.is_empty()) {
            (_, true) => captured.stdout.clone(),
            (true, false) => captured.stderr.clone(),
            (false, false) => format!("{}\n{}", captured.stdout.trim_end(), captured.stderr),
        }
    }

    pub(crate) fn attach_reader(&self, reader: JoinHandle<()>) {
        self.readers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(reader);
    }

    /// Wait up to `grace` for reader tasks to hit end of stream.
    pub async fn settle(&self, grace: Duration) {
        let readers: Vec<_> = self
            .readers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        let deadline = tokio::time::Instant::now() + grace;
        for reader in readers {
            let _ = tokio::time::timeout_at(deadline, reader).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CapturedOutput> {
        self.captured
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    exit_code: i32,
    ended_at: Instant,
    ended_at_ms: u64,
}

/// A tracked, killable and waitable process.
#[derive(Debug)]
pub struct ManagedSession {
    session_id: String,
    command: String,
    working_directory: Option<PathBuf>,
    handle: Option<Box<dyn ProcessHandle>>,
    output: Arc<OutputBuffer>,
    started_at: Instant,
    started_at_ms: u64,
    completion: Mutex<Option<Completion>>,
}

impl ManagedSession {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        command: impl Into<String>,
        working_directory: Option<PathBuf>,
        handle: Option<Box<dyn ProcessHandle>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            working_directory,
            handle,
            output: Arc::new(OutputBuffer::new()),
            started_at: Instant::now(),
            started_at_ms: unix_millis(),
            completion: Mutex::new(None),
        }
    }

    #[must_use]
    pub(crate) fn with_output(mut self, output: Arc<OutputBuffer>) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    #[must_use]
    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid())
    }

    #[must_use]
    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    #[must_use]
    pub fn ended_at_ms(&self) -> Option<u64> {
        self.completion().map(|c| c.ended_at_ms)
    }

    /// Time from start until completion, or until now while running.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.completion().map_or_else(
            || self.started_at.elapsed(),
            |c| c.ended_at.duration_since(self.started_at),
        )
    }

    /// Asks the process handle; a session without a handle is never running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.poll_exit().is_none() && self.handle.is_some()
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.poll_exit()
    }

    /// Record the exit code. The first recorded completion wins.
    pub fn mark_completed(&self, exit_code: i32) {
        let mut completion = self
            .completion
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if completion.is_none() {
            *completion = Some(Completion {
                exit_code,
                ended_at: Instant::now(),
                ended_at_ms: unix_millis(),
            });
        }
    }

    /// Force-terminate the process and mark the session completed with `-1`.
    ///
    /// Returns `false` when there is no handle, the process had already exited, or the kill
    /// could not be delivered.
    pub fn kill(&self) -> bool {
        let Some(handle) = &self.handle else {
            return false;
        };
        if let Some(code) = self.poll_exit() {
            tracing::debug!(session_id = %self.session_id, code, "kill on exited session");
            return false;
        }
        match handle.kill() {
            Ok(()) => {
                self.mark_completed(-1);
                tracing::info!(session_id = %self.session_id, "session killed");
                true
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "failed to kill session: {e}");
                false
            }
        }
    }

    /// Poll until the process exits or `timeout` elapses. Returns the exit code if it exited.
    pub async fn wait(&self, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll_exit() {
                self.output.settle(READER_GRACE).await;
                return Some(code);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn completion(&self) -> Option<Completion> {
        *self
            .completion
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Recorded exit code, or the handle's if it has exited since.
    fn poll_exit(&self) -> Option<i32> {
        if let Some(c) = self.completion() {
            return Some(c.exit_code);
        }
        let code = self.handle.as_ref()?.try_exit_code()?;
        self.mark_completed(code);
        self.completion().map(|c| c.exit_code)
    }
}

/// Authoritative registry of in-flight sessions. One lock guards the map; process I/O and
/// liveness checks happen outside it.
#[derive(Debug, Default)]
pub struct ShellSessionManager {
    sessions: Mutex<HashMap<String, Arc<ManagedSession>>>,
}

impl ShellSessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_session(
        &self,
        session_id: impl Into<String>,
        command: impl Into<String>,
        working_directory: Option<PathBuf>,
        handle: Option<Box<dyn ProcessHandle>>,
    ) -> Arc<ManagedSession> {
        let session = Arc::new(ManagedSession::new(
            session_id,
            command,
            working_directory,
            handle,
        ));
        self.track(Arc::clone(&session));
        session
    }

    /// Register an already built session. A different session already tracked under the same
    /// id is displaced and its process killed.
    pub fn track(&self, session: Arc<ManagedSession>) {
        tracing::debug!(session_id = %session.session_id, command = %session.command, "session registered");
        let displaced = self
            .lock()
            .insert(session.session_id.clone(), Arc::clone(&session));
        if let Some(old) = displaced
            && !Arc::ptr_eq(&old, &session)
            && old.is_running()
        {
            tracing::warn!(session_id = %old.session_id, command = %old.command, "killing displaced session");
            old.kill();
        }
    }

    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<Arc<ManagedSession>> {
        self.lock().get(session_id).cloned()
    }

    /// Sessions whose process is still alive.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<Arc<ManagedSession>> {
        let snapshot: Vec<_> = self.lock().values().cloned().collect();
        snapshot.into_iter().filter(|s| s.is_running()).collect()
    }

    pub fn remove_session(&self, session_id: &str) -> Option<Arc<ManagedSession>> {
        self.lock().remove(session_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Kill every tracked process, then empty the registry.
    pub fn clear_all(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, s)| s).collect();
        for session in drained {
            if session.is_running() {
                session.kill();
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ManagedSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
