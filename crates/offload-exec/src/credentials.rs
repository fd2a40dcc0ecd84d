//! Login credentials for a host

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::keys::KeySource;

/// Secret half of the credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Secret {
    /// Password authentication
    Password(String),
    /// Private key file on the local machine
    KeyPath(PathBuf),
    /// Base64-encoded private key held in an environment variable
    KeyEnv(String),
}

impl Secret {
    /// Key source for key-based secrets
    #[must_use]
    pub fn key_source(&self) -> Option<KeySource> {
        match self {
            Secret::Password(_) => None,
            Secret::KeyPath(path) => Some(KeySource::Path(path.clone())),
            Secret::KeyEnv(var) => Some(KeySource::Env(var.clone())),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(<redacted>)"),
            Secret::KeyPath(path) => f.debug_tuple("KeyPath").field(path).finish(),
            Secret::KeyEnv(var) => f.debug_tuple("KeyEnv").field(var).finish(),
        }
    }
}

/// Username and secret used to log into a host
///
/// Held in process memory only. Never written into a remote unit and
/// redacted from `Debug` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login name
    pub username: String,
    /// Password or key
    pub secret: Secret,
}

impl Credentials {
    /// Password credentials
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::Password(password.into()),
        }
    }

    /// Key file credentials
    pub fn key_file(username: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::KeyPath(path.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::password("pi", "hunter2");
        let rendered = format!("{creds:?}");

        assert!(rendered.contains("pi"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_key_source_mapping() {
        let creds = Credentials::key_file("pi", "/home/pi/.ssh/id_ed25519");
        assert_eq!(
            creds.secret.key_source(),
            Some(KeySource::Path(PathBuf::from("/home/pi/.ssh/id_ed25519")))
        );
        assert_eq!(Secret::Password("x".into()).key_source(), None);
    }
}
