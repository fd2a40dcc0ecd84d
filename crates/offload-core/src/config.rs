//! Persisted configuration
//!
//! A [`StoredConfig`] holds everything needed to rebuild a
//! [`ClientContext`](crate::ClientContext) in a later process: the host
//! profile, credentials, runtime, and execution tunables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use offload_exec::Credentials;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::OffloadError;
use crate::locator::HostProfile;
use crate::runtime::Runtime;

/// Execution tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Reachability probe timeout, in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// SSH connect and handshake timeout, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long termination may take before the call returns anyway
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    /// Directory on the host that receives units
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    /// Echo remote output to the local console
    #[serde(default = "default_echo")]
    pub echo: bool,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            termination_grace_ms: default_termination_grace_ms(),
            remote_dir: default_remote_dir(),
            echo: default_echo(),
            log_level: default_log_level(),
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_termination_grace_ms() -> u64 {
    2_000
}

fn default_remote_dir() -> String {
    "/tmp/offload".to_string()
}

fn default_echo() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ExecutionConfig {
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

/// Everything persisted between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredConfig {
    /// Prepared host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostProfile>,
    /// Login for the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Default runtime for registered functions
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Load/save hooks for [`StoredConfig`]
pub trait ConfigStore: Send + Sync {
    /// Stored configuration, `None` if nothing was saved yet
    ///
    /// # Errors
    /// `OffloadError::Config` if the stored data cannot be read
    fn load(&self) -> Result<Option<StoredConfig>, OffloadError>;

    /// Replace the stored configuration
    ///
    /// # Errors
    /// `OffloadError::Config` if the data cannot be written
    fn save(&self, config: &StoredConfig) -> Result<(), OffloadError>;
}

/// [`ConfigStore`] backed by a TOML file
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    path: PathBuf,
}

impl TomlConfigStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/offload/<name>.toml`
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self::new(config_root().join(format!("{name}.toml")))
    }

    /// First existing file among `$OFFLOAD_CONFIG`, `./offload.toml` and
    /// `<config dir>/offload/offload.toml`; the last one if none exists
    #[must_use]
    pub fn discover() -> Self {
        if let Ok(path) = std::env::var("OFFLOAD_CONFIG") {
            return Self::new(path);
        }

        let local = PathBuf::from("offload.toml");
        if local.exists() {
            return Self::new(local);
        }

        Self::new(config_root().join("offload.toml"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn config_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("offload")
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<Option<StoredConfig>, OffloadError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no stored configuration");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| OffloadError::Config(format!("{}: {e}", self.path.display())))?;
        let config = toml::from_str(&content)
            .map_err(|e| OffloadError::Config(format!("{}: {e}", self.path.display())))?;
        Ok(Some(config))
    }

    fn save(&self, config: &StoredConfig) -> Result<(), OffloadError> {
        let content =
            toml::to_string_pretty(config).map_err(|e| OffloadError::Config(e.to_string()))?;
        let io_error = |e: std::io::Error| OffloadError::Config(format!("{}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        std::fs::write(&self.path, content).map_err(io_error)?;

        // Credentials live in this file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .map_err(io_error)?;
        }

        debug!(path = %self.path.display(), "configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("offload-config-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_missing_file_is_none() {
        let store = TomlConfigStore::new(scratch("missing.toml"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let path = scratch("dir").join("main.toml");
        let store = TomlConfigStore::new(&path);
        let config = StoredConfig {
            host: Some(HostProfile::new("192.168.0.10", 2222, 3).with_scan(4)),
            credentials: Some(Credentials::password("pi", "raspberry")),
            runtime: Runtime::shell(),
            execution: ExecutionConfig {
                echo: false,
                ..ExecutionConfig::default()
            },
        };

        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), Some(config));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        std::fs::remove_dir_all(scratch("dir")).unwrap();
    }

    #[test]
    fn test_defaults_fill_partial_file() {
        let config: StoredConfig = toml::from_str(
            r#"
            [host]
            address = "10.0.0.5"

            [execution]
            remote_dir = "/var/tmp/units"
            "#,
        )
        .unwrap();

        let host = config.host.unwrap();
        assert_eq!(host.port, 22);
        assert_eq!(host.attempts, 1);
        assert_eq!(config.runtime, Runtime::python());
        assert_eq!(config.execution.remote_dir, "/var/tmp/units");
        assert_eq!(config.execution.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.execution.termination_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let path = scratch("bad.toml");
        std::fs::write(&path, "host = [").unwrap();

        let result = TomlConfigStore::new(&path).load();
        assert!(matches!(result, Err(OffloadError::Config(_))));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_named_store() {
        let store = TomlConfigStore::named("main");
        assert!(store.path().ends_with("offload/main.toml"));
    }
}
