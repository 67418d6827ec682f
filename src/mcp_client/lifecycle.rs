//! Server process lifecycle management.
//!
//! Handles spawning and shutting down MCP server child processes. Each
//! server runs as a separate OS process communicating via JSON-RPC over
//! stdio; stderr is forwarded to the log and a short tail of it is kept
//! for failure messages.

use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::config::ClientOptions;
use super::errors::McpError;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum stderr bytes retained for failure messages.
const STDERR_TAIL_BYTES: usize = 2000;

/// How long to wait for stderr to drain after the process has died.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── SpawnedProcess ──────────────────────────────────────────────────────────

/// A freshly started server process with its stdio split out.
pub struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: StderrTail,
}

/// Spawn the server process described by `config`.
///
/// The process must survive `options.spawn_grace` to count as started; an
/// early exit is reported as `SpawnFailed` with whatever it wrote to stderr.
pub async fn spawn_process(
    config: &ServerConfig,
    options: &ClientOptions,
) -> Result<SpawnedProcess, McpError> {
    let name = config.name.as_str();
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{}: {e}", config.command),
    })?;

    // Taken before any wait() so the pipes stay open.
    let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = StderrTail::capture(name, child.stderr.take());

    tracing::info!(
        server = name,
        command = %config.command,
        pid = child.id(),
        "spawned MCP server process"
    );

    match tokio::time::timeout(options.spawn_grace, child.wait()).await {
        Err(_) => Ok(SpawnedProcess {
            child,
            stdin,
            stdout,
            stderr,
        }),
        Ok(Ok(status)) => {
            let stderr_ctx = stderr.drain().await;
            Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: format!(
                    "process exited during startup ({status}){}",
                    format_stderr_suffix(&stderr_ctx)
                ),
            })
        }
        Ok(Err(e)) => Err(McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("failed to poll process: {e}"),
        }),
    }
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

/// Stop a server process: SIGTERM, then a forced kill if it is still alive
/// after `grace`. Stdin should already be closed by the caller.
///
/// Returns the exit status when one could be collected.
pub async fn terminate(child: &mut Child, name: &str, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(server = name, %status, "process already exited");
        return Some(status);
    }

    send_sigterm(child, name);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(server = name, %status, "server exited gracefully");
            Some(status)
        }
        Ok(Err(e)) => {
            tracing::warn!(server = name, error = %e, "failed to wait for server exit");
            None
        }
        Err(_) => {
            tracing::warn!(
                server = name,
                grace_ms = grace.as_millis() as u64,
                "server ignored termination request, killing"
            );
            if let Err(e) = child.kill().await {
                tracing::warn!(server = name, error = %e, "failed to kill server process");
                return None;
            }
            child.try_wait().ok().flatten()
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child, name: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: `pid` belongs to a child we have not reaped yet, so it cannot
    // have been recycled for an unrelated process.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(
            server = name,
            error = %std::io::Error::last_os_error(),
            "SIGTERM failed"
        );
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child, name: &str) {
    // No polite signal here; closed stdin is the only request to exit.
    tracing::debug!(server = name, "no SIGTERM on this platform");
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Forwards a server's stderr to the log and keeps the most recent output.
#[derive(Clone)]
pub struct StderrTail {
    buf: Arc<Mutex<String>>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl StderrTail {
    /// Start forwarding `stderr` (if any) under `server`'s name.
    pub fn capture(server: &str, stderr: Option<ChildStderr>) -> Self {
        let buf = Arc::new(Mutex::new(String::new()));
        let Some(stderr) = stderr else {
            return Self {
                buf,
                task: Arc::new(tokio::sync::Mutex::new(None)),
            };
        };

        let server = server.to_string();
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        tracing::debug!(server = %server, line = %line, "server stderr");
                        push_tail(&mut sink.lock().unwrap_or_else(PoisonError::into_inner), &line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(server = %server, error = %e, "stderr read failed");
                        break;
                    }
                }
            }
        });

        Self {
            buf,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Current tail, trimmed.
    pub fn snapshot(&self) -> String {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trim()
            .to_string()
    }

    /// Wait briefly for the process's remaining stderr, then return the tail.
    pub async fn drain(&self) -> String {
        if let Some(handle) = self.task.lock().await.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, handle).await.is_err() {
                abort.abort();
            }
        }
        self.snapshot()
    }

    /// ` | stderr: ...` for error messages, or empty.
    pub fn suffix(&self) -> String {
        format_stderr_suffix(&self.snapshot())
    }
}

/// Append a line, keeping only the last `STDERR_TAIL_BYTES` bytes.
fn push_tail(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
    if buf.len() > STDERR_TAIL_BYTES {
        let mut cut = buf.len() - STDERR_TAIL_BYTES;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {stderr}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_options() -> ClientOptions {
        ClientOptions::default()
            .with_spawn_grace(Duration::from_millis(100))
            .with_shutdown_grace(Duration::from_millis(500))
    }

    #[test]
    fn test_push_tail_keeps_recent_output() {
        let mut buf = String::new();
        for i in 0..1000 {
            push_tail(&mut buf, &format!("line {i}"));
        }
        assert!(buf.len() <= STDERR_TAIL_BYTES);
        assert!(buf.ends_with("line 999\n"));
        assert!(!buf.contains("line 1\n"));
    }

    #[test]
    fn test_push_tail_respects_char_boundaries() {
        let mut buf = String::new();
        for _ in 0..800 {
            push_tail(&mut buf, "ünïcödé");
        }
        assert!(buf.len() <= STDERR_TAIL_BYTES);
        assert!(buf.ends_with("ünïcödé\n"));
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("  \n"), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = ServerConfig::new("ghost", "/nonexistent/mcp-hub-test-binary");
        let err = spawn_process(&config, &fast_options()).await.err().unwrap();
        match err {
            McpError::SpawnFailed { name, .. } => assert_eq!(name, "ghost"),
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_reports_stderr() {
        let config = ServerConfig::new("quitter", "sh")
            .with_args(["-c", "echo 'missing dependency' >&2; exit 3"]);
        let err = spawn_process(&config, &fast_options()).await.err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("exited during startup"), "{msg}");
        assert!(msg.contains("missing dependency"), "{msg}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_graceful_and_forced() {
        let opts = fast_options();

        // Exits on SIGTERM.
        let config = ServerConfig::new("polite", "sh").with_args(["-c", "exec sleep 30"]);
        let mut spawned = spawn_process(&config, &opts).await.unwrap();
        let status = terminate(&mut spawned.child, "polite", opts.shutdown_grace).await;
        assert!(status.is_some());

        // Ignores SIGTERM and has to be killed.
        let config = ServerConfig::new("stubborn", "sh")
            .with_args(["-c", "trap '' TERM; while :; do sleep 1; done"]);
        let mut spawned = spawn_process(&config, &opts).await.unwrap();
        let start = std::time::Instant::now();
        terminate(&mut spawned.child, "stubborn", opts.shutdown_grace).await;
        assert!(start.elapsed() >= opts.shutdown_grace);
        assert!(spawned.child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new("envy", "sh")
            .with_args(["-c", "echo \"$MCP_HUB_TEST_VAR $(pwd)\" >&2; exit 0"])
            .with_env("MCP_HUB_TEST_VAR", "hello")
            .with_cwd(&dir.path().to_string_lossy());
        let err = spawn_process(&config, &fast_options()).await.err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("hello"), "{msg}");
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(msg.contains(&dir_name), "{msg}");
    }
}
