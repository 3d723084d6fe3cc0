//! External process backend for command-line instruments.
//!
//! Some "instruments" are programs: throughput testers, OS network utilities, vendor CLIs.
//! This backend treats the executable as the resource:
//!
//! - [`ProcessBackend::run`] performs a one-shot invocation and returns its stdout.
//! - [`ProcessBackend::execute`] starts a background invocation whose stdout is captured
//!   continuously; [`ProcessBackend::running`] reports liveness and `read()` drains what has
//!   been captured so far; [`ProcessBackend::clear`] discards it.
//! - `query(cmd)` splits the command on whitespace and runs it as arguments, so ordinary
//!   attribute templates work against a CLI.
//!
//! Closing the backend kills a live background invocation.

use super::{resolve_timeout, Backend, BackendKind};
use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Captured stderr keeps only this many of the newest bytes.
pub const STDERR_LIMIT: usize = 64 * 1024;

/// Process connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessParams {
    /// Executable name or path
    pub executable: PathBuf,
    /// Arguments placed before every invocation's own arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Timeout for one-shot invocations; falls back to the device default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ProcessParams {
    /// Parameters for an executable with no base arguments.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Add base arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the one-shot timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Check the executable reference.
    ///
    /// Bare names are resolved through `PATH` at spawn time; anything containing a path
    /// separator must exist now.
    pub fn validate(&self) -> DeviceResult<()> {
        let resource = self.executable.display().to_string();
        if resource.trim().is_empty() {
            return Err(DeviceError::connection(resource, "executable is empty"));
        }
        if self.executable.components().count() > 1 && !self.executable.exists() {
            return Err(DeviceError::connection(resource, "executable not found"));
        }
        Ok(())
    }
}

/// Backend driving an external executable.
pub struct ProcessBackend {
    params: ProcessParams,
    resource: String,
    timeout: Duration,
    open: bool,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    captured: Arc<Mutex<Vec<u8>>>,
    errors: Arc<Mutex<Vec<u8>>>,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessBackend {
    /// Unopened backend.
    pub fn new(params: ProcessParams, default_timeout: Duration) -> Self {
        let timeout = resolve_timeout(params.timeout_ms, default_timeout);
        let resource = params.executable.display().to_string();
        Self {
            params,
            resource,
            timeout,
            open: false,
            child: None,
            stdin: None,
            captured: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
            pumps: Vec::new(),
        }
    }

    fn command(&self, extra: &[String]) -> Command {
        let mut command = Command::new(&self.params.executable);
        command
            .args(&self.params.args)
            .args(extra)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::command(format!(
                "process backend '{}' is not open",
                self.resource
            )))
        }
    }

    /// Run once with extra arguments and return stdout.
    ///
    /// A non-zero exit status is a command error carrying stderr.
    pub async fn run(&mut self, extra: &[String]) -> DeviceResult<Vec<u8>> {
        self.ensure_open()?;
        debug!(executable = %self.resource, args = ?extra, "running process");
        let output = tokio::time::timeout(self.timeout, self.command(extra).output())
            .await
            .map_err(|_| DeviceError::command_timeout("process run", self.timeout))?
            .map_err(|e| DeviceError::command(format!("failed to run '{}': {e}", self.resource)))?;
        if !output.status.success() {
            return Err(DeviceError::command(format!(
                "'{}' exited with {}: {}",
                self.resource,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Start a background invocation with extra arguments, capturing its output.
    pub async fn execute(&mut self, extra: &[String]) -> DeviceResult<()> {
        self.ensure_open()?;
        if self.running() {
            return Err(DeviceError::command(format!(
                "'{}' is already running",
                self.resource
            )));
        }
        self.clear_buffers();
        self.stop_pumps();

        let mut child = self
            .command(extra)
            .spawn()
            .map_err(|e| DeviceError::command(format!("failed to spawn '{}': {e}", self.resource)))?;
        if let Some(stdout) = child.stdout.take() {
            self.pumps.push(pump(stdout, Arc::clone(&self.captured), usize::MAX));
        }
        if let Some(stderr) = child.stderr.take() {
            self.pumps.push(pump(stderr, Arc::clone(&self.errors), STDERR_LIMIT));
        }
        self.stdin = child.stdin.take();
        info!(executable = %self.resource, args = ?extra, pid = ?child.id(), "process started");
        self.child = Some(child);
        Ok(())
    }

    /// Whether the background invocation is still alive.
    pub fn running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(executable = %self.resource, %status, "process exited");
                false
            }
            Err(e) => {
                warn!(executable = %self.resource, error = %e, "could not poll process");
                false
            }
        }
    }

    /// Kill the background invocation, keeping captured output.
    pub async fn kill(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(executable = %self.resource, error = %e, "kill failed");
            }
        }
    }

    /// Captured stderr of the background invocation, at most [`STDERR_LIMIT`] bytes.
    #[must_use]
    pub fn stderr(&self) -> Vec<u8> {
        self.errors.lock().clone()
    }

    /// Take everything captured from stdout so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut *self.captured.lock())
    }

    /// Discard captured output.
    pub fn clear_buffers(&mut self) {
        self.captured.lock().clear();
        self.errors.lock().clear();
    }

    fn stop_pumps(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

fn pump<R>(mut source: R, sink: Arc<Mutex<Vec<u8>>>, limit: usize) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => append_bounded(&mut sink.lock(), &chunk[..n], limit),
            }
        }
    })
}

/// Append `bytes`, then drop the oldest bytes beyond `limit`.
fn append_bounded(buffer: &mut Vec<u8>, bytes: &[u8], limit: usize) {
    buffer.extend_from_slice(bytes);
    if buffer.len() > limit {
        let excess = buffer.len() - limit;
        buffer.drain(..excess);
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    async fn open(&mut self) -> DeviceResult<()> {
        self.params.validate()?;
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.kill().await;
        self.stop_pumps();
        self.open = false;
        debug!(executable = %self.resource, "process backend closed");
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write(&mut self, command: &[u8]) -> DeviceResult<()> {
        self.ensure_open()?;
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            DeviceError::command("no running process accepts input".to_string())
        })?;
        let mut line = command.to_vec();
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| DeviceError::command(format!("write to process failed: {e}")))
    }

    async fn read(&mut self) -> DeviceResult<Vec<u8>> {
        self.ensure_open()?;
        Ok(self.take_output())
    }

    async fn query(&mut self, command: &[u8]) -> DeviceResult<Vec<u8>> {
        let args: Vec<String> = String::from_utf8_lossy(command)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        self.run(&args).await
    }

    async fn clear(&mut self) -> DeviceResult<()> {
        self.clear_buffers();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh() -> ProcessBackend {
        ProcessBackend::new(
            ProcessParams::new("/bin/sh").with_args(["-c"]),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let mut backend = sh();
        backend.open().await.unwrap();
        let out = backend.run(&["echo hello".to_string()]).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[tokio::test]
    async fn test_failed_run_is_command_error() {
        let mut backend = sh();
        backend.open().await.unwrap();
        let err = backend.run(&["echo oops >&2; exit 3".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn test_execute_running_and_read() {
        let mut backend = sh();
        backend.open().await.unwrap();
        backend
            .execute(&["echo one; echo two".to_string()])
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while backend.running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!backend.running());
        // Let the pump flush the tail of stdout.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let out = backend.read().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out), "one\ntwo\n");
        assert!(backend.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_kills_background_process() {
        let mut backend = sh();
        backend.open().await.unwrap();
        backend.execute(&["sleep 30".to_string()]).await.unwrap();
        assert!(backend.running());
        backend.close().await;
        assert!(!backend.running());
        assert!(!backend.is_open());
        assert!(backend.run(&["true".to_string()]).await.is_err());
    }

    #[test]
    fn test_append_bounded_keeps_newest_bytes() {
        let mut buffer = b"abc".to_vec();
        append_bounded(&mut buffer, b"defg", 5);
        assert_eq!(buffer, b"cdefg");
        append_bounded(&mut buffer, b"h", usize::MAX);
        assert_eq!(buffer, b"cdefgh");
    }

    #[tokio::test]
    async fn test_background_stderr_is_capped() {
        let mut backend = sh();
        backend.open().await.unwrap();
        backend
            .execute(&["head -c 200000 /dev/zero >&2; printf end >&2".to_string()])
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !backend.stderr().ends_with(b"end") && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let errors = backend.stderr();
        assert_eq!(errors.len(), STDERR_LIMIT);
        assert!(errors.ends_with(b"\0\0end"));
        backend.close().await;
    }

    #[test]
    fn test_missing_path_fails_validation() {
        let params = ProcessParams::new("/definitely/not/here/iperf");
        assert!(matches!(params.validate(), Err(DeviceError::Connection { .. })));
        assert!(ProcessParams::new("iperf").validate().is_ok());
    }
}
