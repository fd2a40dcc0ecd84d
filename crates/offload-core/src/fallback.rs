//! Remote-or-local dispatch decision

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::OffloadError;
use crate::session::{Session, SessionManager};

/// Where a call runs
#[derive(Debug)]
pub enum Dispatch {
    /// On the prepared host, over this session
    Remote(Session),
    /// In-process
    Local {
        /// Why the host was not used
        reason: String,
    },
}

/// Decides, per call, whether the host is usable
///
/// Nothing is remembered between calls: a host that failed once is tried
/// again on the next call.
#[derive(Debug, Clone)]
pub struct FallbackCoordinator {
    sessions: Arc<SessionManager>,
}

impl FallbackCoordinator {
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Remote dispatch if a session can be acquired, local otherwise
    pub async fn resolve(&self, function: &str) -> Dispatch {
        match self.sessions.acquire().await {
            Ok(session) => {
                debug!(function, host = %session.address(), "dispatching remotely");
                Dispatch::Remote(session)
            }
            Err(e) => {
                info!(function, reason = %e, "host unusable, running locally");
                Dispatch::Local {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Whether a remote failure on `session` should be retried in-process
    ///
    /// The session is shared with concurrent calls, so it is dropped only
    /// when the connection itself failed. The next call then reconnects.
    pub async fn recover(&self, function: &str, session: &Session, error: &OffloadError) -> bool {
        if !error.triggers_fallback() {
            return false;
        }

        info!(function, error = %error, "remote call failed, running locally");
        if matches!(error, OffloadError::Connection(_)) || !session.is_alive() {
            self.sessions.invalidate().await;
        } else {
            debug!(function, host = %session.address(), "session kept");
        }
        true
    }
}
