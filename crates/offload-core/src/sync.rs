//! Single-file exchange with the host
//!
//! No conflict detection: the last push wins, and callers order their own
//! pull, edit, and push.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::OffloadError;
use crate::session::SessionManager;

/// Pulls and pushes files over the context's session
#[derive(Debug, Clone)]
pub struct FileSync {
    sessions: Arc<SessionManager>,
}

impl FileSync {
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Contents of `remote_path`
    ///
    /// # Errors
    /// `OffloadError::NotFound` if the file does not exist; connection and
    /// transfer failures are returned as is.
    #[instrument(skip(self))]
    pub async fn pull(&self, remote_path: &str) -> Result<Vec<u8>, OffloadError> {
        let session = self.sessions.acquire().await?;
        let data = session.transport().download(remote_path).await?;
        info!(host = %session.address(), bytes = data.len(), "pulled file");
        Ok(data)
    }

    /// Contents of `remote_path` as UTF-8 text
    ///
    /// # Errors
    /// As [`FileSync::pull`], plus `OffloadError::Transfer` for non-UTF-8
    /// contents.
    pub async fn pull_to_string(&self, remote_path: &str) -> Result<String, OffloadError> {
        let data = self.pull(remote_path).await?;
        String::from_utf8(data)
            .map_err(|e| OffloadError::Transfer(format!("{remote_path} is not UTF-8: {e}")))
    }

    /// Replace `remote_path` with `data`, creating parent directories
    ///
    /// # Errors
    /// Connection and transfer failures
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn push(&self, data: &[u8], remote_path: &str) -> Result<(), OffloadError> {
        let session = self.sessions.acquire().await?;
        session.transport().upload(data, remote_path).await?;
        info!(host = %session.address(), "pushed file");
        Ok(())
    }

    /// Pull `remote_path`, apply `edit`, and push the result back
    ///
    /// # Errors
    /// As [`FileSync::pull`] and [`FileSync::push`]
    pub async fn edit<F>(&self, remote_path: &str, edit: F) -> Result<(), OffloadError>
    where
        F: FnOnce(Vec<u8>) -> Vec<u8>,
    {
        let current = self.pull(remote_path).await?;
        self.push(&edit(current), remote_path).await
    }
}
