//! Loopback transport using `tokio::process`
//!
//! Treats the local machine as the host. Used when the configured address
//! is the local machine, and as a stand-in host in tests.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

use crate::error::ExecError;
use crate::result::{CommandResult, ProcessEvent, RemoteProcess};
use crate::traits::Transport;

const READ_BUFFER: usize = 4096;

/// Local command transport
///
/// Executes commands on the local machine through `sh -c`.
#[derive(Debug, Clone)]
pub struct LocalTransport;

impl LocalTransport {
    /// Create a new local transport
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn command(cmd: &str) -> Command {
        // Use shell to support pipes, redirections, etc.
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    }

    /// Internal method to execute command
    #[instrument(skip(self, input), level = "debug")]
    async fn execute(&self, cmd: &str, input: Option<&[u8]>) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        debug!(command = %cmd, "executing local command");

        let mut child = Self::command(cmd)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            // Feed stdin concurrently so a chatty child cannot deadlock us
            let data = data.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    warn!(error = %e, "failed to write command input");
                }
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let duration = start.elapsed();

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(
            command = %cmd,
            status = status,
            duration = ?duration,
            "command completed"
        );

        if !output.status.success() {
            error!(
                command = %cmd,
                status = status,
                stderr = %stderr,
                "command failed"
            );
        }

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn pump<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // Keep draining even if nobody listens any more
                let _ = tx.send(wrap(buf[..n].to_vec()));
            }
            Err(e) => {
                let _ = tx.send(ProcessEvent::Lost(e.to_string()));
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    #[instrument(skip(self), level = "debug")]
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.execute(cmd, None).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        debug!(command = %cmd, timeout = ?timeout_duration, "executing with timeout");

        match timeout(timeout_duration, self.execute(cmd, None)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    command = %cmd,
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    #[instrument(skip(self, input), level = "debug")]
    async fn run_with_input(&self, cmd: &str, input: &[u8]) -> Result<CommandResult, ExecError> {
        self.execute(cmd, Some(input)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn spawn(&self, cmd: &str) -> Result<RemoteProcess, ExecError> {
        debug!(command = %cmd, "spawning local process");

        let mut child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::SpawnError("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::SpawnError("stderr not captured".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let out = tokio::spawn(pump(stdout, tx.clone(), ProcessEvent::Stdout));
        let err = tokio::spawn(pump(stderr, tx.clone(), ProcessEvent::Stderr));

        tokio::spawn(async move {
            // Reap first; descendants may hold the pipes open for longer
            let event = match child.wait().await {
                Ok(status) => ProcessEvent::Exit(status.code()),
                Err(e) => ProcessEvent::Lost(e.to_string()),
            };
            let _ = out.await;
            let _ = err.await;
            let _ = tx.send(event);
        });

        Ok(RemoteProcess::new(rx))
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("offload-local-{}-{name}", std::process::id()))
            .display()
            .to_string()
    }

    #[tokio::test]
    async fn test_run_success() {
        let transport = LocalTransport::new();
        let result = transport.run("echo hello").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let transport = LocalTransport::new();
        let result = transport.run("exit 42").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.status, 42);
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let transport = LocalTransport::new();
        let result = transport
            .run_with_timeout("sleep 5", Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_run_with_input() {
        let transport = LocalTransport::new();
        let result = transport.run_with_input("tr a-z A-Z", b"shout").await.unwrap();

        assert_eq!(result.stdout, "SHOUT");
    }

    #[tokio::test]
    async fn test_spawn_streams_in_order() {
        let transport = LocalTransport::new();
        let mut process = transport
            .spawn("echo one; echo two >&2; exit 3")
            .await
            .unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit = None;
        while let Some(event) = process.next_event().await {
            match event {
                ProcessEvent::Stdout(data) => stdout.extend(data),
                ProcessEvent::Stderr(data) => stderr.extend(data),
                ProcessEvent::Exit(status) => exit = Some(status),
                ProcessEvent::Lost(reason) => panic!("lost: {reason}"),
            }
        }

        assert_eq!(stdout, b"one\n");
        assert_eq!(stderr, b"two\n");
        assert_eq!(exit, Some(Some(3)));
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let transport = LocalTransport::new();
        let path = scratch_path("roundtrip/data.bin");
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        transport.upload(&payload, &path).await.unwrap();
        let fetched = transport.download(&path).await.unwrap();

        assert_eq!(fetched, payload);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let transport = LocalTransport::new();
        let result = transport.download(&scratch_path("missing.txt")).await;

        assert!(matches!(result, Err(ExecError::NotFound(_))));
    }
}
