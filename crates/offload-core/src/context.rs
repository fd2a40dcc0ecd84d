//! Client context
//!
//! Holds what would otherwise be process-wide state: the prepared host,
//! credentials, the live session, context globals, and the registry of
//! function identifiers. Contexts are independent of each other.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use offload_exec::{Credentials, LocalTransport, Transport};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::{ConfigStore, ExecutionConfig, StoredConfig};
use crate::error::OffloadError;
use crate::fallback::{Dispatch, FallbackCoordinator};
use crate::locator::HostProfile;
use crate::proxy::FunctionBuilder;
use crate::runtime::{Runtime, dedent};
use crate::session::{Connector, DefaultConnector, SessionManager};
use crate::stream::{Console, OutputStream, StdConsole};
use crate::sync::FileSync;

/// Output of [`ClientContext::run_command`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout and stderr, interleaved in arrival order
    pub output: String,
    /// Exit status; `None` if the command was killed by a signal
    pub status: Option<i32>,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Builder for [`ClientContext`]
#[derive(Default)]
pub struct ClientContextBuilder {
    connector: Option<Arc<dyn Connector>>,
    console: Option<Arc<dyn Console>>,
    runtime: Runtime,
    execution: ExecutionConfig,
    host: Option<HostProfile>,
    credentials: Option<Credentials>,
}

impl ClientContextBuilder {
    /// Transport factory, SSH with loopback shortcut by default
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Echo target, the local stdout/stderr by default
    #[must_use]
    pub fn console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = Some(console);
        self
    }

    /// Default runtime for registered functions
    #[must_use]
    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = runtime;
        self
    }

    #[must_use]
    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Start from a stored configuration
    #[must_use]
    pub fn config(mut self, config: StoredConfig) -> Self {
        self.host = config.host;
        self.credentials = config.credentials;
        self.runtime = config.runtime;
        self.execution = config.execution;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<ClientContext> {
        let sessions = Arc::new(SessionManager::new(
            self.connector.unwrap_or_else(|| Arc::new(DefaultConnector)),
            self.execution.probe_timeout(),
            self.execution.connect_timeout(),
        ));
        if let Some(host) = self.host {
            sessions.prepare(host);
        }
        if let Some(credentials) = self.credentials {
            sessions.set_credentials(credentials);
        }

        Arc::new(ClientContext {
            sessions,
            globals: RwLock::new(BTreeMap::new()),
            helpers: RwLock::new(Vec::new()),
            registry: Mutex::new(HashSet::new()),
            runtime: self.runtime,
            execution: self.execution,
            console: self.console.unwrap_or_else(|| Arc::new(StdConsole)),
        })
    }
}

/// Entry point for remote execution
pub struct ClientContext {
    sessions: Arc<SessionManager>,
    globals: RwLock<BTreeMap<String, Value>>,
    helpers: RwLock<Vec<(Runtime, String)>>,
    registry: Mutex<HashSet<String>>,
    runtime: Runtime,
    execution: ExecutionConfig,
    console: Arc<dyn Console>,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("sessions", &self.sessions)
            .field("runtime", &self.runtime)
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

impl ClientContext {
    #[must_use]
    pub fn builder() -> ClientContextBuilder {
        ClientContextBuilder::default()
    }

    /// Context built from `store`, or with defaults if it is empty
    ///
    /// # Errors
    /// `OffloadError::Config` if the store cannot be read
    pub fn load(store: &dyn ConfigStore) -> Result<Arc<Self>, OffloadError> {
        let config = store.load()?.unwrap_or_default();
        Ok(Self::builder().config(config).build())
    }

    /// Persist host, credentials, runtime, and tunables to `store`
    ///
    /// # Errors
    /// `OffloadError::Config` if the store cannot be written
    pub fn save(&self, store: &dyn ConfigStore) -> Result<(), OffloadError> {
        store.save(&StoredConfig {
            host: self.sessions.locator().profile(),
            credentials: self.sessions.credentials(),
            runtime: self.runtime.clone(),
            execution: self.execution.clone(),
        })
    }

    /// Set the host; nothing touches the network until the next call
    pub fn prepare(&self, address: impl Into<String>, port: u16, attempts: u32) -> HostProfile {
        self.sessions.prepare(HostProfile::new(address, port, attempts))
    }

    /// Set the host from a complete profile
    pub fn prepare_profile(&self, profile: HostProfile) -> HostProfile {
        self.sessions.prepare(profile)
    }

    /// Set the login, kept in memory only
    pub fn set_credentials(&self, credentials: Credentials) {
        self.sessions.set_credentials(credentials);
    }

    /// Define or replace a global visible to registered functions
    ///
    /// # Errors
    /// `OffloadError::Marshal` if the value cannot be serialized
    pub fn set_global<T: Serialize>(&self, name: impl Into<String>, value: &T) -> Result<(), OffloadError> {
        let name = name.into();
        let value = serde_json::to_value(value)
            .map_err(|e| OffloadError::Marshal(format!("global {name:?}: {e}")))?;
        self.globals.write().insert(name, value);
        Ok(())
    }

    /// Remove a global, returning its last value
    pub fn remove_global(&self, name: &str) -> Option<Value> {
        self.globals.write().remove(name)
    }

    /// Snapshot of every global
    #[must_use]
    pub fn globals(&self) -> BTreeMap<String, Value> {
        self.globals.read().clone()
    }

    /// Add helper definitions to every unit of the context's runtime
    ///
    /// Helpers are rendered ahead of the called function on each remote
    /// run. Local runs are unaffected.
    ///
    /// # Errors
    /// `OffloadError::Marshal` if `source` defines no function
    pub fn add_helper(&self, source: impl Into<String>) -> Result<Vec<String>, OffloadError> {
        self.add_helper_for(self.runtime.clone(), source)
    }

    /// [`ClientContext::add_helper`] for units of `runtime`
    ///
    /// # Errors
    /// `OffloadError::Marshal` if `source` defines no function
    pub fn add_helper_for(
        &self,
        runtime: Runtime,
        source: impl Into<String>,
    ) -> Result<Vec<String>, OffloadError> {
        let source: String = source.into();
        let source = dedent(&source);
        let defined = runtime.definitions(&source);
        if defined.is_empty() {
            return Err(OffloadError::Marshal(
                "helper source does not define a function".to_string(),
            ));
        }

        debug!(helpers = ?defined, "helper added");
        self.helpers.write().push((runtime, source));
        Ok(defined)
    }

    /// Helper sources for units of `runtime`, in the order added
    #[must_use]
    pub fn helpers_for(&self, runtime: &Runtime) -> Vec<String> {
        self.helpers
            .read()
            .iter()
            .filter(|(r, _)| r == runtime)
            .map(|(_, source)| source.clone())
            .collect()
    }

    /// Start registering a function
    ///
    /// `source` is the function in the context's runtime; `local` is the
    /// same function in Rust, used when the host is not usable.
    pub fn function<A, R, F>(
        self: &Arc<Self>,
        id: impl Into<String>,
        source: impl Into<String>,
        local: F,
    ) -> FunctionBuilder<A, R>
    where
        A: Serialize + Send + 'static,
        R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        FunctionBuilder::new(Arc::clone(self), id.into(), source.into(), Arc::new(local))
    }

    /// Reserve a function identifier
    pub(crate) fn claim(&self, id: &str) -> Result<(), OffloadError> {
        if self.registry.lock().insert(id.to_string()) {
            Ok(())
        } else {
            Err(OffloadError::DuplicateFunction(id.to_string()))
        }
    }

    /// Run a shell command on the host, or locally if it is unusable
    ///
    /// # Errors
    /// `OffloadError::StreamInterrupted` if the transport fails while the
    /// command runs, transfer errors from the local fallback.
    #[instrument(skip(self))]
    pub async fn run_command(&self, command: &str, echo: bool) -> Result<CommandOutput, OffloadError> {
        let coordinator = self.fallback();
        let console = if echo { Some(&*self.console) } else { None };

        if let Dispatch::Remote(session) = coordinator.resolve("run_command").await {
            match stream_command(session.transport().as_ref(), command, console).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    if !coordinator.recover("run_command", &session, &e).await {
                        return Err(e);
                    }
                }
            }
        }

        stream_command(&LocalTransport::new(), command, console).await
    }

    /// File exchange over this context's session
    #[must_use]
    pub fn files(&self) -> FileSync {
        FileSync::new(Arc::clone(&self.sessions))
    }

    /// Contents of a remote file
    ///
    /// # Errors
    /// See [`FileSync::pull`]
    pub async fn pull(&self, remote_path: &str) -> Result<Vec<u8>, OffloadError> {
        self.files().pull(remote_path).await
    }

    /// Replace a remote file
    ///
    /// # Errors
    /// See [`FileSync::push`]
    pub async fn push(&self, data: &[u8], remote_path: &str) -> Result<(), OffloadError> {
        self.files().push(data, remote_path).await
    }

    /// Close the live session; the next call connects afresh
    ///
    /// # Errors
    /// Transport error while disconnecting
    pub async fn reset(&self) -> Result<(), OffloadError> {
        info!("resetting session");
        self.sessions.close().await
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn fallback(&self) -> FallbackCoordinator {
        FallbackCoordinator::new(Arc::clone(&self.sessions))
    }

    /// Default runtime for registered functions
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    #[must_use]
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Echo target, if echo is enabled
    #[must_use]
    pub fn console(&self) -> Option<&dyn Console> {
        self.execution.echo.then_some(&*self.console)
    }
}

async fn stream_command(
    transport: &dyn Transport,
    command: &str,
    console: Option<&dyn Console>,
) -> Result<CommandOutput, OffloadError> {
    let process = transport.spawn(command).await?;

    // Commands carry no return value; the marker never matches
    let marker = format!("@@offload-none-{}", Uuid::new_v4().simple());
    let summary = OutputStream::new(process, marker).relay(console).await;

    if let Some(reason) = summary.lost {
        return Err(OffloadError::StreamInterrupted(reason));
    }
    Ok(CommandOutput {
        output: summary.output,
        status: summary.exit.flatten(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TomlConfigStore;

    #[tokio::test]
    async fn test_run_command_falls_back_locally() {
        let context = ClientContext::builder().build();
        let output = context.run_command("echo local; exit 3", false).await.unwrap();

        assert_eq!(output.output, "local\n");
        assert_eq!(output.status, Some(3));
        assert!(!output.success());
    }

    #[test]
    fn test_globals_are_snapshots() {
        let context = ClientContext::builder().build();
        context.set_global("i", &1_234_567_890_u64).unwrap();

        let snapshot = context.globals();
        context.set_global("i", &0).unwrap();

        assert_eq!(snapshot["i"], serde_json::json!(1_234_567_890_u64));
        assert_eq!(context.remove_global("i"), Some(serde_json::json!(0)));
    }

    #[test]
    fn test_helpers_are_kept_per_runtime() {
        let context = ClientContext::builder().runtime(Runtime::shell()).build();

        let defined = context.add_helper("shout() {\n  echo \"$1!\"\n}").unwrap();
        assert_eq!(defined, vec!["shout"]);
        assert!(matches!(
            context.add_helper("echo not a function"),
            Err(OffloadError::Marshal(_))
        ));

        assert_eq!(context.helpers_for(&Runtime::shell()).len(), 1);
        assert!(context.helpers_for(&Runtime::python()).is_empty());
    }

    #[test]
    fn test_contexts_are_independent() {
        let first = ClientContext::builder().build();
        let second = ClientContext::builder().build();

        first.prepare("10.0.0.1", 22, 2);
        first.claim("f").unwrap();

        assert!(!second.sessions().is_prepared());
        assert!(second.claim("f").is_ok());
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("offload-context-{}.toml", std::process::id()));
        let store = TomlConfigStore::new(&path);

        let context = ClientContext::builder().runtime(Runtime::shell()).build();
        context.prepare("192.168.1.20", 2200, 3);
        context.set_credentials(Credentials::password("pi", "raspberry"));
        context.save(&store).unwrap();

        let restored = ClientContext::load(&store).unwrap();
        assert_eq!(
            restored.sessions().locator().profile(),
            Some(HostProfile::new("192.168.1.20", 2200, 3))
        );
        assert_eq!(
            restored.sessions().credentials(),
            Some(Credentials::password("pi", "raspberry"))
        );
        assert_eq!(restored.runtime(), &Runtime::shell());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_console_follows_echo() {
        let quiet = ClientContext::builder()
            .execution(ExecutionConfig {
                echo: false,
                ..ExecutionConfig::default()
            })
            .build();
        assert!(quiet.console().is_none());
        assert!(ClientContext::builder().build().console().is_some());
    }
}
