//! Result types for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success)
    pub status: i32,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Connection information for SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
}

fn default_port() -> u16 {
    22
}

impl ConnectionInfo {
    /// Create new connection info
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Event emitted by a spawned process, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Bytes written to stdout
    Stdout(Vec<u8>),
    /// Bytes written to stderr
    Stderr(Vec<u8>),
    /// Process ended. `None` when it was killed by a signal
    Exit(Option<i32>),
    /// Transport failed before the process ended
    Lost(String),
}

/// Handle to a process started with [`Transport::spawn`](crate::Transport::spawn)
///
/// Events are pumped by a background task owned by the transport, so the
/// process never blocks on a slow reader.
#[derive(Debug)]
pub struct RemoteProcess {
    events: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl RemoteProcess {
    /// Wrap an event receiver fed by a pump task
    #[must_use]
    pub fn new(events: mpsc::UnboundedReceiver<ProcessEvent>) -> Self {
        Self { events }
    }

    /// Next event, or `None` once the pump task has finished
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }
}
