//! Core error types for offload-core

use offload_exec::ExecError;
use thiserror::Error;

use crate::job::JobState;

/// Errors that can occur while dispatching a call
#[derive(Error, Debug, Clone)]
pub enum OffloadError {
    /// No host has been prepared
    #[error("no host prepared")]
    NotPrepared,

    /// Host unreachable or credentials rejected
    #[error("connection failed: {0}")]
    Connection(String),

    /// Moving a unit or file to or from the host failed
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Function call cannot be turned into a self-contained unit
    #[error("cannot marshal call: {0}")]
    Marshal(String),

    /// Terminal output missing or malformed
    #[error("cannot decode result: {0}")]
    ResultDecode(String),

    /// Remote package installation failed
    #[error("failed to install dependency {package}: {message}")]
    DependencyInstall {
        /// Package that could not be installed
        package: String,
        /// Installer output
        message: String,
    },

    /// Transport dropped while the remote process was running
    #[error("output stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Remote file does not exist
    #[error("no such remote file: {0}")]
    NotFound(String),

    /// Function identifier already registered on this context
    #[error("function already registered: {0}")]
    DuplicateFunction(String),

    /// Job state machine violation
    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: JobState,
        /// Attempted target state
        to: JobState,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl OffloadError {
    /// Whether the call should be retried in-process
    ///
    /// Only reachability failures qualify. Data-integrity failures are
    /// surfaced since running locally would hide them.
    #[must_use]
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            OffloadError::NotPrepared | OffloadError::Connection(_) | OffloadError::Transfer(_)
        )
    }
}

impl From<ExecError> for OffloadError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::NotFound(path) => OffloadError::NotFound(path),
            ExecError::ConfigError(msg) => OffloadError::Config(msg),
            e if e.is_connection_error() => OffloadError::Connection(e.to_string()),
            e => OffloadError::Transfer(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_classification() {
        assert!(OffloadError::Connection("refused".into()).triggers_fallback());
        assert!(OffloadError::Transfer("broken pipe".into()).triggers_fallback());
        assert!(!OffloadError::Marshal("closure".into()).triggers_fallback());
        assert!(!OffloadError::ResultDecode("no marker".into()).triggers_fallback());
        assert!(
            !OffloadError::DependencyInstall {
                package: "requests".into(),
                message: "pip missing".into()
            }
            .triggers_fallback()
        );
    }

    #[test]
    fn test_exec_error_mapping() {
        let err: OffloadError = ExecError::AuthenticationFailed("denied".into()).into();
        assert!(matches!(err, OffloadError::Connection(_)));

        let err: OffloadError = ExecError::NotFound("/tmp/a".into()).into();
        assert!(matches!(err, OffloadError::NotFound(p) if p == "/tmp/a"));

        let err: OffloadError = ExecError::IoError("reset".into()).into();
        assert!(matches!(err, OffloadError::Transfer(_)));
    }
}
