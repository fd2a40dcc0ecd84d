//! Remote executor
//!
//! Runs a [`RemoteJob`] on a transport: upload the unit, install missing
//! dependencies, launch it and relay its output. A launched unit leads its
//! own process group and records the group id next to the script, so the
//! whole tree can be terminated from another channel.

use std::sync::Arc;
use std::time::Duration;

use offload_exec::Transport;
use offload_exec::traits::quote;
use serde_json::Value;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, instrument, warn};

use crate::error::OffloadError;
use crate::job::{JobState, RemoteJob};
use crate::marshal::RemoteUnit;
use crate::stream::{Console, OutputStream};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of [`RemoteExecutor::terminate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process is gone
    Confirmed,
    /// The grace period ran out first
    Unconfirmed,
}

/// Executes jobs over one transport
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    remote_dir: String,
    grace: Duration,
}

impl std::fmt::Debug for RemoteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("transport", &self.transport.transport_type())
            .field("remote_dir", &self.remote_dir)
            .field("grace", &self.grace)
            .finish()
    }
}

impl RemoteExecutor {
    /// Executor placing units under `remote_dir`, giving up on termination
    /// after `grace`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, remote_dir: impl Into<String>, grace: Duration) -> Self {
        Self {
            transport,
            remote_dir: remote_dir.into(),
            grace,
        }
    }

    /// Pending job for `unit`
    #[must_use]
    pub fn prepare_job(&self, unit: RemoteUnit, deadline: Option<Instant>) -> RemoteJob {
        RemoteJob::new(unit, &self.remote_dir, deadline)
    }

    /// Drive `job` to completion and return the decoded value
    ///
    /// The job ends `Completed` on success and `Failed` on any error.
    /// Console chunks are echoed while the process runs.
    ///
    /// # Errors
    /// Whatever stopped the job; see [`OffloadError`].
    #[instrument(skip_all, fields(job = %job.unit().id(), function = %job.unit().function()))]
    pub async fn run(
        &self,
        job: &mut RemoteJob,
        console: Option<&dyn Console>,
    ) -> Result<Value, OffloadError> {
        let result = self.drive(job, console).await;
        if let Err(e) = &result {
            warn!(error = %e, state = %job.state(), "job failed");
            job.fail(e);
        }
        result
    }

    async fn drive(
        &self,
        job: &mut RemoteJob,
        console: Option<&dyn Console>,
    ) -> Result<Value, OffloadError> {
        job.transition(JobState::Transferring)?;
        self.transport
            .upload(job.unit().script().as_bytes(), job.unit_path())
            .await?;

        if !job.unit().dependencies().is_empty() {
            job.transition(JobState::InstallingDeps)?;
            self.install_dependencies(job.unit()).await?;
        }

        job.transition(JobState::Running)?;
        let command = self.launch_command(job)?;
        let process = self.transport.spawn(&command).await?;

        let summary = OutputStream::new(process, job.unit().marker())
            .relay(console)
            .await;
        let value = summary.decode()?;

        job.complete(value.clone())?;
        Ok(value)
    }

    /// Install every dependency the host does not already have
    async fn install_dependencies(&self, unit: &RemoteUnit) -> Result<(), OffloadError> {
        let runtime = unit.runtime();

        for dependency in unit.dependencies() {
            let probe = runtime.dependency_probe(dependency)?;
            if self.transport.run(&probe).await?.success() {
                debug!(module = %dependency.module, "dependency already present");
                continue;
            }

            info!(package = %dependency.package, "installing dependency");
            let install = runtime.dependency_install(dependency)?;
            let result = self.transport.run(&install).await?;
            if !result.success() {
                return Err(OffloadError::DependencyInstall {
                    package: dependency.package.clone(),
                    message: result.combined_output().trim().to_string(),
                });
            }
        }

        Ok(())
    }

    /// Shell command that runs the unit in a new session
    ///
    /// The session leader claims the pid file with noclobber before
    /// starting the interpreter, and gives up if it is already taken.
    fn launch_command(&self, job: &RemoteJob) -> Result<String, OffloadError> {
        let dir = quote(self.remote_dir.trim_end_matches('/'))?;
        let pid = quote(job.pid_path())?;
        let script = quote(job.unit_path())?;

        let leader = format!(
            "set -C; echo $$ > {pid} || exit 125; {}",
            job.unit().runtime().launch(&script)
        );
        Ok(format!("cd {dir} && exec setsid -w sh -c {}", quote(&leader)?))
    }

    /// Stop every process in the job's process group
    ///
    /// Sends TERM, escalates to KILL halfway through the grace period, and
    /// returns once the group is empty or the grace period is over. A unit
    /// that has not recorded its group yet is prevented from starting.
    #[instrument(skip_all, fields(job = %job.unit().id()))]
    pub async fn terminate(&self, job: &RemoteJob) -> Termination {
        let started = Instant::now();
        let give_up = started + self.grace;
        let escalate = started + self.grace / 2;

        let Ok(pid) = quote(job.pid_path()) else {
            return Termination::Unconfirmed;
        };

        loop {
            let signal = if Instant::now() >= escalate { "KILL" } else { "TERM" };
            let script = termination_script(&pid, signal);

            match timeout_at(give_up, self.transport.run(&script)).await {
                Ok(Ok(result)) if result.status == 0 => {
                    info!(elapsed = ?started.elapsed(), "remote process terminated");
                    return Termination::Confirmed;
                }
                Ok(Ok(result)) => debug!(status = result.status, signal, "termination pending"),
                Ok(Err(e)) => debug!(error = %e, "termination probe failed"),
                Err(_) => break,
            }

            if Instant::now() + POLL_INTERVAL >= give_up {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }

        warn!(
            grace = ?self.grace,
            "remote process not confirmed stopped within grace period"
        );
        Termination::Unconfirmed
    }

    /// Remove the unit and pid file from the host
    ///
    /// Failures are logged; they never change the call's result.
    pub async fn cleanup(&self, job: &RemoteJob) {
        let command = match (quote(job.unit_path()), quote(job.pid_path())) {
            (Ok(unit), Ok(pid)) => format!("rm -f {unit} {pid}"),
            _ => return,
        };

        match self.transport.run_with_timeout(&command, self.grace).await {
            Ok(result) if result.success() => debug!(job = %job.unit().id(), "remote files removed"),
            Ok(result) => warn!(
                job = %job.unit().id(),
                stderr = %result.stderr.trim(),
                "failed to remove remote files"
            ),
            Err(e) => warn!(job = %job.unit().id(), error = %e, "failed to remove remote files"),
        }
    }
}

/// One termination step against the group recorded in `pid`
///
/// Exits 0 once no live member is left or the unit was stopped before it
/// started, 1 while the step must be repeated. Zombies do not count as
/// live: orphans may wait for a slow reaper.
fn termination_script(pid: &str, signal: &str) -> String {
    format!(
        r#"if ! pgid=$(cat {pid} 2>/dev/null); then
  (set -C; echo cancelled > {pid}) 2>/dev/null && exit 0
  exit 1
fi
case "$pgid" in
  cancelled) exit 0 ;;
  ''|*[!0-9]*) exit 1 ;;
esac
if command -v ps >/dev/null 2>&1; then
  ps -A -o pgid= -o stat= | awk -v g="$pgid" '$1 == g && $2 !~ /^Z/ {{ n++ }} END {{ exit (n == 0) }}' || exit 0
else
  kill -s 0 -- "-$pgid" 2>/dev/null || exit 0
fi
kill -s {signal} -- "-$pgid" 2>/dev/null
exit 1
"#
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use offload_exec::LocalTransport;
    use serde_json::json;

    use super::*;
    use crate::marshal::{FunctionSpec, Marshaller};
    use crate::runtime::{Dependency, Runtime};

    fn scratch_dir(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("offload-exec-{}-{name}", std::process::id()))
            .display()
            .to_string()
    }

    // Zombies count as dead; they only wait for a reaper
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                let state = stat
                    .rsplit(')')
                    .next()
                    .and_then(|rest| rest.trim_start().chars().next());
                !matches!(state, Some('Z' | 'X'))
            }
            Err(_) => false,
        }
    }

    fn executor(name: &str) -> RemoteExecutor {
        RemoteExecutor::new(
            Arc::new(LocalTransport::new()),
            scratch_dir(name),
            Duration::from_secs(2),
        )
    }

    fn job(executor: &RemoteExecutor, source: &str, requires: &[Dependency], args: Value) -> RemoteJob {
        let spec = FunctionSpec::new("f", Runtime::shell(), source, &[], requires).unwrap();
        let unit = Marshaller.marshal(&spec, args, &BTreeMap::new()).unwrap();
        executor.prepare_job(unit, None)
    }

    #[tokio::test]
    async fn test_run_returns_value() {
        let executor = executor("value");
        let mut job = job(
            &executor,
            "f() {\n  echo \"adding $1 and $2\"\n  offload_return \"$(($1 + $2))\"\n}",
            &[],
            json!([2, 3]),
        );

        let value = executor.run(&mut job, None).await.unwrap();
        assert_eq!(value, json!(5));
        assert_eq!(job.state(), JobState::Completed);

        executor.cleanup(&job).await;
        assert!(!Path::new(job.unit_path()).exists());
        assert!(!Path::new(job.pid_path()).exists());
    }

    #[tokio::test]
    async fn test_function_without_return_yields_null() {
        let executor = executor("null");
        let mut job = job(&executor, "f() { echo hi; }", &[], Value::Null);

        assert_eq!(executor.run(&mut job, None).await.unwrap(), Value::Null);
        executor.cleanup(&job).await;
    }

    #[tokio::test]
    async fn test_failing_function_is_decode_error() {
        let executor = executor("fails");
        let mut job = job(&executor, "f() { echo boom >&2; return 4; }", &[], Value::Null);

        let err = executor.run(&mut job, None).await.unwrap_err();
        assert!(matches!(err, OffloadError::ResultDecode(_)));
        assert_eq!(job.state(), JobState::Failed);
        executor.cleanup(&job).await;
    }

    #[tokio::test]
    async fn test_present_dependency_is_noop() {
        let executor = executor("deps");
        let mut job = job(
            &executor,
            "f() { offload_return '\"ok\"'; }",
            &[Dependency::named("sh")],
            Value::Null,
        );

        assert_eq!(executor.run(&mut job, None).await.unwrap(), json!("ok"));
        executor.cleanup(&job).await;
    }

    #[tokio::test]
    async fn test_terminate_running_job() {
        let executor = executor("terminate");
        let mut job = job(&executor, "f() { sleep 5; }", &[], Value::Null);

        let raced = tokio::time::timeout(Duration::from_millis(300), executor.run(&mut job, None)).await;
        assert!(raced.is_err());
        assert_eq!(job.state(), JobState::Running);

        let started = std::time::Instant::now();
        assert_eq!(executor.terminate(&job).await, Termination::Confirmed);
        assert!(started.elapsed() < Duration::from_secs(2));
        executor.cleanup(&job).await;
    }

    #[tokio::test]
    async fn test_terminate_reaches_grandchildren() {
        let executor = executor("grandchild");
        let pid_file = format!("{}.grandchild", scratch_dir("grandchild"));
        let mut job = job(
            &executor,
            "f() {\n  ( sh -c 'echo $$ > \"$0\"; sleep 30; :' \"$1\"; : )\n}",
            &[],
            json!([pid_file]),
        );

        let raced = tokio::time::timeout(Duration::from_millis(500), executor.run(&mut job, None)).await;
        assert!(raced.is_err());

        assert_eq!(executor.terminate(&job).await, Termination::Confirmed);
        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(!is_running(pid.trim()));

        executor.cleanup(&job).await;
        std::fs::remove_file(&pid_file).unwrap();
    }

    #[tokio::test]
    async fn test_terminate_before_launch_stops_the_unit() {
        let executor = executor("unlaunched");
        std::fs::create_dir_all(&executor.remote_dir).unwrap();
        let mut job = job(&executor, "f() { offload_return '\"ran\"'; }", &[], Value::Null);

        let started = std::time::Instant::now();
        assert_eq!(executor.terminate(&job).await, Termination::Confirmed);
        assert!(started.elapsed() < Duration::from_secs(1));

        // The pid file is taken, so the unit never starts
        let err = executor.run(&mut job, None).await.unwrap_err();
        assert!(matches!(err, OffloadError::ResultDecode(_)));
        executor.cleanup(&job).await;
    }
}
