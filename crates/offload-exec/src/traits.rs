//! Transport trait

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::ExecError;
use crate::result::{CommandResult, RemoteProcess};

/// Exit status used by [`Transport::download`] when the file is missing
const EXIT_NO_INPUT: i32 = 66;

/// A connected, authenticated channel to one host
///
/// File transfer is implemented on top of command execution so every
/// transport gets it for free; it only relies on `sh` and `base64` being
/// present on the host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a command to completion and capture its output
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Same as [`run`](Self::run), bounded by `timeout`
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Run a command with `input` fed to its stdin
    async fn run_with_input(&self, cmd: &str, input: &[u8]) -> Result<CommandResult, ExecError>;

    /// Start a command and stream its output as it is produced
    async fn spawn(&self, cmd: &str) -> Result<RemoteProcess, ExecError>;

    /// Whether the underlying connection is still usable
    fn is_alive(&self) -> bool;

    /// Tear down the connection
    async fn close(&self) -> Result<(), ExecError>;

    fn transport_type(&self) -> &'static str;

    /// Write `data` to `remote_path`, creating parent directories
    ///
    /// The file is written next to its destination and renamed into place,
    /// so a reader never observes a half-written file.
    async fn upload(&self, data: &[u8], remote_path: &str) -> Result<(), ExecError> {
        let target = quote(remote_path)?;
        let staging = quote(&format!("{remote_path}.offload-part"))?;
        let cmd = format!(
            "mkdir -p \"$(dirname -- {target})\" && base64 -d > {staging} && mv -f {staging} {target}"
        );

        let encoded = STANDARD.encode(data);
        let result = self.run_with_input(&cmd, encoded.as_bytes()).await?;
        if !result.success() {
            return Err(ExecError::CommandFailed {
                status: result.status,
                stderr: result.stderr,
            });
        }
        Ok(())
    }

    /// Read the whole content of `remote_path`
    async fn download(&self, remote_path: &str) -> Result<Vec<u8>, ExecError> {
        let target = quote(remote_path)?;
        let cmd = format!("[ -f {target} ] || exit {EXIT_NO_INPUT}; base64 < {target}");

        let result = self.run(&cmd).await?;
        if result.status == EXIT_NO_INPUT {
            return Err(ExecError::NotFound(remote_path.to_string()));
        }
        if !result.success() {
            return Err(ExecError::CommandFailed {
                status: result.status,
                stderr: result.stderr,
            });
        }

        let compact: String = result
            .stdout
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(compact)
            .map_err(|e| ExecError::IoError(format!("corrupt transfer of {remote_path}: {e}")))
    }
}

/// Quote a single shell word
///
/// # Errors
/// Returns `ExecError::ConfigError` for strings that cannot be quoted (NUL bytes)
pub fn quote(word: &str) -> Result<String, ExecError> {
    shlex::try_quote(word)
        .map(|q| q.into_owned())
        .map_err(|e| ExecError::ConfigError(format!("cannot quote {word:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_and_spaces() {
        assert_eq!(quote("/tmp/offload/unit.py").unwrap(), "/tmp/offload/unit.py");
        assert_eq!(quote("/tmp/my dir/x").unwrap(), "'/tmp/my dir/x'");
    }

    #[test]
    fn test_quote_rejects_nul() {
        assert!(matches!(quote("a\0b"), Err(ExecError::ConfigError(_))));
    }
}
