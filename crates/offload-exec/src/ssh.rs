//! SSH transport using russh crate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use crate::credentials::{Credentials, Secret};
use crate::error::ExecError;
use crate::result::{CommandResult, ConnectionInfo, ProcessEvent, RemoteProcess};
use crate::traits::Transport;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// SSH transport
///
/// Wraps one authenticated SSH session. Every command runs on its own
/// channel, so concurrent jobs share the connection but not their output.
pub struct SshTransport {
    /// Connection configuration
    conn_info: ConnectionInfo,
    /// SSH session, `None` once closed
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("conn_info", &self.conn_info)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl SshTransport {
    /// Connect and authenticate
    ///
    /// Either returns a fully authenticated transport or an error; a
    /// half-open session is disconnected before returning.
    ///
    /// # Errors
    /// Returns `ExecError::ConnectionFailed` when the TCP/SSH handshake fails
    /// or exceeds `connect_timeout`, `ExecError::AuthenticationFailed` when
    /// the server rejects the credentials, and `ExecError::SshKeyError` when
    /// the private key cannot be loaded.
    #[instrument(skip(credentials), fields(host = %conn_info.host, port = conn_info.port))]
    pub async fn connect(
        conn_info: ConnectionInfo,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> Result<Self, ExecError> {
        info!(
            host = %conn_info.host,
            port = conn_info.port,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..client::Config::default()
        });

        let connecting = client::connect(
            config,
            (&conn_info.host[..], conn_info.port),
            SshClientHandler,
        );
        let mut session = timeout(connect_timeout, connecting)
            .await
            .map_err(|_| {
                ExecError::ConnectionFailed(format!("handshake timed out after {connect_timeout:?}"))
            })?
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        if let Err(e) = authenticate(&mut session, &conn_info.user, credentials).await {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(e);
        }

        info!(host = %conn_info.host, "SSH connected and authenticated");

        Ok(Self {
            conn_info,
            session: Mutex::new(Some(session)),
        })
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    async fn open_channel(&self) -> Result<Channel<client::Msg>, ExecError> {
        let session_lock = self.session.lock().await;
        let session = session_lock.as_ref().ok_or(ExecError::NotConnected)?;

        if session.is_closed() {
            return Err(ExecError::NotConnected);
        }

        session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    /// Execute command on remote host
    #[instrument(skip(self, cmd, input), fields(host = %self.conn_info.host))]
    async fn execute_remote(
        &self,
        cmd: &str,
        input: Option<&[u8]>,
    ) -> Result<CommandResult, ExecError> {
        debug!(command = %cmd, "executing remote command");

        let start = Instant::now();
        let mut channel = self.open_channel().await?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        if let Some(data) = input {
            channel
                .data(data)
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            channel
                .eof()
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
        }

        // Collect output
        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    stdout.extend_from_slice(&data);
                }
                ChannelMsg::ExtendedData { data, ext } => {
                    if ext == 1 {
                        // stderr
                        stderr.extend_from_slice(&data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    status = exit_status.cast_signed();
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        debug!(
            command = %cmd,
            status = status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }
}

async fn authenticate(
    session: &mut client::Handle<SshClientHandler>,
    user: &str,
    credentials: &Credentials,
) -> Result<(), ExecError> {
    let accepted = match &credentials.secret {
        Secret::Password(password) => session
            .authenticate_password(user, password)
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
            .success(),
        secret => {
            let source = secret.key_source().ok_or_else(|| {
                ExecError::AuthenticationFailed("No authentication method available".to_string())
            })?;
            let key = source
                .resolve()
                .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
            let key_pair =
                load_secret_key(key.path(), None).map_err(|e| ExecError::SshKeyError(e.to_string()))?;

            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            session
                .authenticate_publickey(
                    user,
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
                .success()
        }
    };

    if accepted {
        Ok(())
    } else {
        Err(ExecError::AuthenticationFailed(format!(
            "server rejected credentials for {user}"
        )))
    }
}

/// Forward channel messages until the channel closes
async fn pump(mut channel: Channel<client::Msg>, tx: mpsc::UnboundedSender<ProcessEvent>) {
    let mut exit = None;
    let mut finished = false;

    while let Some(msg) = channel.wait().await {
        // Send errors mean the reader went away; keep draining regardless
        match msg {
            ChannelMsg::Data { data } => {
                let _ = tx.send(ProcessEvent::Stdout(data.to_vec()));
            }
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                let _ = tx.send(ProcessEvent::Stderr(data.to_vec()));
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit = Some(exit_status.cast_signed());
                finished = true;
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                debug!(signal = ?signal_name, "remote process killed by signal");
                finished = true;
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    let event = if finished {
        ProcessEvent::Exit(exit)
    } else {
        ProcessEvent::Lost("channel closed before the process reported its exit".to_string())
    };
    let _ = tx.send(event);
}

#[async_trait]
impl Transport for SshTransport {
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.execute_remote(cmd, None).await
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        debug!(command = %cmd, timeout = ?timeout_duration, "executing with timeout");

        match timeout(timeout_duration, self.execute_remote(cmd, None)).await {
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

    #[instrument(skip(self, input), fields(host = %self.conn_info.host))]
    async fn run_with_input(&self, cmd: &str, input: &[u8]) -> Result<CommandResult, ExecError> {
        self.execute_remote(cmd, Some(input)).await
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn spawn(&self, cmd: &str) -> Result<RemoteProcess, ExecError> {
        debug!(command = %cmd, "spawning remote process");

        let channel = self.open_channel().await?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(channel, tx));

        Ok(RemoteProcess::new(rx))
    }

    fn is_alive(&self) -> bool {
        // A held lock means a channel is being opened right now
        self.session
            .try_lock()
            .map(|s| s.as_ref().is_some_and(|h| !h.is_closed()))
            .unwrap_or(true)
    }

    /// Disconnect from remote host
    async fn close(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "ssh"
    }
}
