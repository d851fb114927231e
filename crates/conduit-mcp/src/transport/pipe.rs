//! Child-process transport over stdin/stdout.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio_util::sync::CancellationToken;

use super::{FrameWriter, Lifecycle, Transport, TransportKind};
use crate::dispatcher::ResponseDispatcher;
use crate::error::{McpError, Result};
use crate::protocol::Message;

/// How long a child gets to exit after stdin closes before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Number of stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 200;

/// How to launch the server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stop_grace: Duration,
}

impl PipeConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Captured stderr of the child.
#[derive(Debug, Default)]
struct StderrLog {
    lines: parking_lot::Mutex<VecDeque<String>>,
    saw_error: AtomicBool,
}

impl StderrLog {
    fn record(&self, line: String) {
        if is_real_error(&line) {
            self.saw_error.store(true, Ordering::SeqCst);
            tracing::warn!(stderr = %line, "MCP server reported an error");
        } else {
            tracing::debug!(stderr = %line, "MCP server stderr");
        }
        let mut lines = self.lines.lock();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

/// Transport that talks to a spawned child over its stdin and stdout.
#[derive(Debug)]
pub struct PipeTransport {
    config: PipeConfig,
    dispatcher: Arc<ResponseDispatcher>,
    writer: FrameWriter<ChildStdin>,
    child: tokio::sync::Mutex<Option<Child>>,
    stderr: Arc<StderrLog>,
    lifecycle: Lifecycle,
}

impl PipeTransport {
    pub fn new(config: PipeConfig, dispatcher: Arc<ResponseDispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            writer: FrameWriter::new(),
            child: tokio::sync::Mutex::new(None),
            stderr: Arc::new(StderrLog::default()),
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// The most recent stderr lines, newline separated.
    pub fn stderr_output(&self) -> String {
        let lines = self.stderr.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Whether any stderr line looked like a real failure.
    pub fn has_reported_errors(&self) -> bool {
        self.stderr.saw_error.load(Ordering::SeqCst)
    }

    fn spawn_stderr_reader(&self, stderr: ChildStderr, cancel: CancellationToken) {
        let log = self.stderr.clone();
        self.lifecycle.spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                let next = tokio::select! {
                    biased;
                    next = lines.next_line() => next,
                    _ = cancel.cancelled() => break,
                };
                match next {
                    Ok(Some(line)) if !line.trim().is_empty() => log.record(line),
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "Stopped reading MCP server stderr");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start()?;

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::spawn_failed(format!("{}: {e}", self.config.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::spawn_failed("stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::spawn_failed("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::spawn_failed("stderr not captured"))?;

        tracing::info!(
            command = %self.config.command,
            args = ?self.config.args,
            pid = child.id(),
            "Started MCP server process"
        );

        self.writer.attach(stdin).await;
        self.lifecycle
            .spawn_reader(stdout, self.dispatcher.clone(), self.config.command.clone());
        self.spawn_stderr_reader(stderr, self.lifecycle.token());
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if !self.lifecycle.is_running() {
            return Err(McpError::ConnectionClosed);
        }
        let result = self.writer.write(message).await;
        if let Err(e) = &result {
            if e.is_transport() {
                self.dispatcher.close(&e.to_string());
            }
        }
        result
    }

    async fn stop(&self) -> Result<()> {
        // Closing stdin asks the child to exit.
        self.writer.close().await;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(command = %self.config.command, %status, "MCP server exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(command = %self.config.command, error = %e, "Failed to wait for MCP server");
                }
                Err(_) => {
                    tracing::warn!(
                        command = %self.config.command,
                        grace_ms = self.config.stop_grace.as_millis() as u64,
                        "MCP server did not exit in time, killing"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill MCP server");
                    }
                }
            }
        }

        self.lifecycle.shutdown().await;
        self.dispatcher.close("transport stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }
}

/// Whether a stderr line reports a real failure rather than routine chatter.
///
/// Logging prefixes, configuration messages and the intermediate exceptions of
/// code-running agents are not failures even when they mention errors.
pub fn is_real_error(line: &str) -> bool {
    const CHATTER: &[&str] = &[
        "loading configuration",
        "successfully obtained token",
        "api call succeeded",
        "configuration loaded",
        "server started",
        "starting on stdin/stdout",
        "registered",
        "processing",
        "sending:",
        "received:",
        "response:",
        "received message:",
        "parsed message",
        "timeout:",
        "looking for config",
        "reading config",
        "executable directory",
    ];
    const RECOVERABLE: &[&str] = &[
        "code execution failed",
        "invalid file paths detected",
        "nameerror:",
        "syntaxerror:",
        "typeerror:",
        "valueerror:",
        "attributeerror:",
        "importerror:",
        "keyerror:",
        "indexerror:",
    ];
    const FAILURES: &[&str] = &[
        "error:",
        "failed:",
        "panic:",
        "fatal:",
        "authentication failed",
        "connection refused",
        "timed out",
        "timeout exceeded",
        "permission denied",
    ];

    let lower = line.to_lowercase();
    if lower.starts_with("debug:") || lower.starts_with("info:") {
        return false;
    }
    if CHATTER.iter().chain(RECOVERABLE).any(|p| lower.contains(p)) {
        return false;
    }
    FAILURES.iter().any(|p| lower.contains(p))
}
