//! Session lifecycle: connect, reuse, reconnect, close

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use offload_exec::{ConnectionInfo, Credentials, ExecError, LocalTransport, SshTransport, Transport};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::OffloadError;
use crate::locator::{HostLocator, HostProfile, Reachability};

/// Opens transports to a resolved address
///
/// Allows injection of different transports per host.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate to `address`
    async fn connect(
        &self,
        address: &str,
        profile: &HostProfile,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ExecError>;
}

/// SSH for remote hosts, loopback for the local machine
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        address: &str,
        profile: &HostProfile,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ExecError> {
        // For localhost connections, use LocalTransport
        if HostProfile::is_loopback(address) {
            return Ok(Arc::new(LocalTransport::new()));
        }

        let credentials = credentials.ok_or_else(|| {
            ExecError::AuthenticationFailed("no credentials configured".to_string())
        })?;
        let info = ConnectionInfo::new(address, &credentials.username).with_port(profile.port);
        let transport = SshTransport::connect(info, credentials, timeout).await?;
        Ok(Arc::new(transport))
    }
}

/// A live, authenticated connection to the prepared host
#[derive(Clone)]
pub struct Session {
    profile: HostProfile,
    address: String,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("port", &self.profile.port)
            .field("transport", &self.transport.transport_type())
            .field("alive", &self.transport.is_alive())
            .finish()
    }
}

impl Session {
    /// Resolved address this session is connected to
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Profile the session was opened for
    #[must_use]
    pub fn profile(&self) -> &HostProfile {
        &self.profile
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Liveness flag
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }
}

/// Owns the credentials and the single live session of a context
///
/// Connect and reconnect are serialized: concurrent callers wait for the
/// attempt in flight instead of opening their own.
pub struct SessionManager {
    locator: HostLocator,
    credentials: RwLock<Option<Credentials>>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    live: Mutex<Option<Session>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("locator", &self.locator)
            .field("has_credentials", &self.credentials.read().is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with nothing prepared
    pub fn new(
        connector: Arc<dyn Connector>,
        probe_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            locator: HostLocator::new(probe_timeout),
            credentials: RwLock::new(None),
            connector,
            connect_timeout,
            live: Mutex::new(None),
        }
    }

    /// Host locator
    #[must_use]
    pub fn locator(&self) -> &HostLocator {
        &self.locator
    }

    /// Prepare (or re-prepare) the host
    ///
    /// A session opened for a previous profile is discarded on next use.
    pub fn prepare(&self, profile: HostProfile) -> HostProfile {
        self.locator.prepare(profile)
    }

    /// Whether a host has been prepared
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.locator.profile().is_some()
    }

    /// Store credentials in memory
    pub fn set_credentials(&self, credentials: Credentials) {
        info!(user = %credentials.username, "credentials set");
        *self.credentials.write() = Some(credentials);
    }

    /// Stored credentials
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().clone()
    }

    /// Return the live session, connecting if needed
    ///
    /// A dead or stale session is never reused. Connection is attempted up
    /// to `profile.attempts` times with linear backoff; exhausting them is
    /// terminal for this call only.
    ///
    /// # Errors
    /// `OffloadError::NotPrepared` when no host is prepared,
    /// `OffloadError::Connection` when every attempt failed.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<Session, OffloadError> {
        let profile = self.locator.profile().ok_or(OffloadError::NotPrepared)?;
        let mut live = self.live.lock().await;

        if let Some(session) = live.as_ref()
            && session.profile == profile
            && session.is_alive()
        {
            return Ok(session.clone());
        }

        if let Some(stale) = live.take() {
            debug!(address = %stale.address, "discarding dead or stale session");
            if let Err(e) = stale.transport.close().await {
                debug!(error = %e, "failed to close stale session");
            }
        }

        let credentials = self.credentials();
        let attempts = profile.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.open(&profile, credentials.as_ref()).await {
                Ok(session) => {
                    info!(address = %session.address, attempt, "session established");
                    *live = Some(session.clone());
                    return Ok(session);
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "connection attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(profile.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(OffloadError::Connection(format!(
            "{} unreachable after {attempts} attempt(s): {last_error}",
            profile.address
        )))
    }

    async fn open(
        &self,
        profile: &HostProfile,
        credentials: Option<&Credentials>,
    ) -> Result<Session, ExecError> {
        let Reachability::Reachable { address } = self.locator.probe(profile).await else {
            return Err(ExecError::ConnectionFailed(format!(
                "no candidate answered on port {}",
                profile.port
            )));
        };

        let transport = self
            .connector
            .connect(&address, profile, credentials, self.connect_timeout)
            .await?;

        // A session is only handed out once it can actually run a command
        let check = transport.run_with_timeout("true", self.connect_timeout).await;
        match check {
            Ok(result) if result.success() => Ok(Session {
                profile: profile.clone(),
                address,
                transport,
            }),
            Ok(result) => {
                let _ = transport.close().await;
                Err(ExecError::ConnectionFailed(format!(
                    "health check exited with {}",
                    result.status
                )))
            }
            Err(e) => {
                let _ = transport.close().await;
                Err(e)
            }
        }
    }

    /// Drop the live session so the next call reconnects
    pub async fn invalidate(&self) {
        if let Some(session) = self.live.lock().await.take() {
            info!(address = %session.address, "session invalidated");
            if let Err(e) = session.transport.close().await {
                debug!(error = %e, "failed to close invalidated session");
            }
        }
    }

    /// Close the live session, if any
    ///
    /// # Errors
    /// Returns the transport error if disconnecting fails
    pub async fn close(&self) -> Result<(), OffloadError> {
        if let Some(session) = self.live.lock().await.take() {
            session.transport.close().await?;
        }
        Ok(())
    }
}
