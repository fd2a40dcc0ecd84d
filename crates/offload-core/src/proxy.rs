//! Call proxy: registered functions that run wherever the host allows
//!
//! A [`RemoteFunction`] pairs a local Rust implementation with the source
//! of the same function in the remote runtime. Calling it runs the source
//! on the host when one is usable and the local implementation otherwise;
//! both paths return the same type.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::context::ClientContext;
use crate::error::OffloadError;
use crate::executor::RemoteExecutor;
use crate::fallback::Dispatch;
use crate::marshal::{FunctionSpec, Marshaller, RemoteUnit};
use crate::runtime::{Dependency, Runtime};
use crate::session::Session;
use crate::supervisor::{JobOutcome, TimeoutSupervisor};

type LocalFn<A, R> = Arc<dyn Fn(A) -> R + Send + Sync>;

/// Configures a function before registration
pub struct FunctionBuilder<A, R> {
    context: Arc<ClientContext>,
    id: String,
    source: String,
    local: LocalFn<A, R>,
    entry: Option<String>,
    globals: Vec<String>,
    requires: Vec<Dependency>,
    runtime: Option<Runtime>,
    timeout: Option<(Duration, R)>,
}

impl<A, R> FunctionBuilder<A, R>
where
    A: Serialize + Send + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        context: Arc<ClientContext>,
        id: String,
        source: String,
        local: LocalFn<A, R>,
    ) -> Self {
        Self {
            context,
            id,
            source,
            local,
            entry: None,
            globals: Vec::new(),
            requires: Vec::new(),
            runtime: None,
            timeout: None,
        }
    }

    /// Function the source defines under a name other than the identifier
    #[must_use]
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Context global the function reads
    #[must_use]
    pub fn global(mut self, name: impl Into<String>) -> Self {
        self.globals.push(name.into());
        self
    }

    /// Dependency to install before running, `package` providing `module`
    #[must_use]
    pub fn requires(mut self, module: impl Into<String>, package: impl Into<String>) -> Self {
        self.requires.push(Dependency::new(module, package));
        self
    }

    /// Runtime for this function instead of the context default
    #[must_use]
    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Return `default` when a remote run exceeds `timeout`
    #[must_use]
    pub fn timeout(mut self, timeout: Duration, default: R) -> Self {
        self.timeout = Some((timeout, default));
        self
    }

    /// Analyse the source and reserve the identifier
    ///
    /// # Errors
    /// `OffloadError::Marshal` if the source cannot be used or does not
    /// define the entry function,
    /// `OffloadError::DuplicateFunction` if the identifier is taken.
    pub fn register(self) -> Result<RemoteFunction<A, R>, OffloadError> {
        let runtime = self
            .runtime
            .unwrap_or_else(|| self.context.runtime().clone());
        let entry = self.entry.unwrap_or_else(|| self.id.clone());
        let spec = FunctionSpec::with_entry(
            &self.id,
            entry,
            runtime,
            self.source,
            &self.globals,
            &self.requires,
        )?;
        self.context.claim(&self.id)?;

        debug!(
            function = %self.id,
            entry = %spec.entry(),
            globals = ?spec.globals(),
            "function registered"
        );

        Ok(RemoteFunction {
            inner: Arc::new(Registered {
                context: self.context,
                spec,
                local: self.local,
                timeout: self.timeout,
            }),
        })
    }
}

struct Registered<A, R> {
    context: Arc<ClientContext>,
    spec: FunctionSpec,
    local: LocalFn<A, R>,
    timeout: Option<(Duration, R)>,
}

/// A registered function
///
/// Cheap to clone; clones share the registration.
pub struct RemoteFunction<A, R> {
    inner: Arc<Registered<A, R>>,
}

impl<A, R> Clone for RemoteFunction<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> fmt::Debug for RemoteFunction<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("id", &self.inner.spec.id())
            .field("timeout", &self.inner.timeout.as_ref().map(|(t, _)| t))
            .finish_non_exhaustive()
    }
}

impl<A, R> RemoteFunction<A, R>
where
    A: Serialize + Send + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn id(&self) -> &str {
        self.inner.spec.id()
    }

    #[must_use]
    pub fn spec(&self) -> &FunctionSpec {
        &self.inner.spec
    }

    /// Configured timeout, if any
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout.as_ref().map(|(timeout, _)| *timeout)
    }

    /// Call the function
    ///
    /// Runs remotely when the host is usable, locally when it is not or
    /// when the remote attempt fails before the function started. A remote
    /// run past the timeout returns the configured default.
    ///
    /// # Errors
    /// Marshalling, result decoding, dependency installation, and
    /// interrupted streams are returned; reachability failures never are.
    #[instrument(skip_all, fields(function = %self.id()))]
    pub async fn call(&self, args: A) -> Result<R, OffloadError> {
        let inner = &self.inner;
        let coordinator = inner.context.fallback();

        let session = match coordinator.resolve(inner.spec.id()).await {
            Dispatch::Remote(session) => session,
            Dispatch::Local { .. } => return Ok(self.call_local(args)),
        };

        let encoded = serde_json::to_value(&args)
            .map_err(|e| OffloadError::Marshal(format!("{}: arguments: {e}", self.id())))?;
        let helpers = inner.context.helpers_for(inner.spec.runtime());
        let unit = Marshaller.marshal_with_helpers(
            &inner.spec,
            encoded,
            &inner.context.globals(),
            &helpers,
        )?;

        match self.call_remote(&session, unit).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if coordinator.recover(inner.spec.id(), &session, &e).await {
                    Ok(self.call_local(args))
                } else {
                    Err(e)
                }
            }
        }
    }

    fn call_local(&self, args: A) -> R {
        (self.inner.local)(args)
    }

    async fn call_remote(
        &self,
        session: &Session,
        unit: RemoteUnit,
    ) -> Result<R, OffloadError> {
        let context = &self.inner.context;
        let execution = context.execution();

        let executor = RemoteExecutor::new(
            session.transport().clone(),
            execution.remote_dir.clone(),
            execution.termination_grace(),
        );
        let supervisor = TimeoutSupervisor::new(executor);

        let (deadline, default) = match &self.inner.timeout {
            Some((timeout, default)) => (Some(Instant::now() + *timeout), Some(default)),
            None => (None, None),
        };
        let mut job = supervisor.executor().prepare_job(unit, deadline);

        let placeholder = match default {
            Some(default) => serde_json::to_value(default)
                .map_err(|e| OffloadError::Marshal(format!("default value: {e}")))?,
            None => Value::Null,
        };

        match supervisor
            .supervise(&mut job, placeholder, context.console())
            .await?
        {
            JobOutcome::Completed(value) => serde_json::from_value(value).map_err(|e| {
                OffloadError::ResultDecode(format!("{}: unexpected return shape: {e}", self.id()))
            }),
            JobOutcome::TimedOut { .. } => match default {
                Some(default) => Ok(default.clone()),
                None => Err(OffloadError::ResultDecode(format!(
                    "{}: timed out without a default",
                    self.id()
                ))),
            },
        }
    }
}
