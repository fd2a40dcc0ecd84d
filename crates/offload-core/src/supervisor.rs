//! Deadline enforcement for remote jobs

use serde_json::Value;
use tokio::time::timeout_at;
use tracing::{info, warn};

use crate::error::OffloadError;
use crate::executor::{RemoteExecutor, Termination};
use crate::job::{JobState, RemoteJob};
use crate::stream::Console;

/// How a supervised job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The job returned this value
    Completed(Value),
    /// The deadline fired first
    TimedOut {
        /// Value handed to the caller in place of the result
        default: Value,
        /// Whether the process was seen to stop; `None` if it never started
        termination: Option<Termination>,
    },
}

impl JobOutcome {
    /// Value the caller receives
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            JobOutcome::Completed(value) | JobOutcome::TimedOut { default: value, .. } => value,
        }
    }
}

/// Races jobs against their deadline
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    executor: RemoteExecutor,
}

impl TimeoutSupervisor {
    #[must_use]
    pub fn new(executor: RemoteExecutor) -> Self {
        Self { executor }
    }

    #[must_use]
    pub fn executor(&self) -> &RemoteExecutor {
        &self.executor
    }

    /// Run `job` until it finishes or its deadline passes
    ///
    /// On expiry the process is terminated and `default` is returned; a
    /// result arriving later is never observed. Remote files are removed
    /// in every case.
    ///
    /// # Errors
    /// Job failures from [`RemoteExecutor::run`]. A timeout is not an error.
    pub async fn supervise(
        &self,
        job: &mut RemoteJob,
        default: Value,
        console: Option<&dyn Console>,
    ) -> Result<JobOutcome, OffloadError> {
        let raced = match job.deadline() {
            Some(deadline) => timeout_at(deadline, self.executor.run(job, console))
                .await
                .ok(),
            None => Some(self.executor.run(job, console).await),
        };

        let outcome = match raced {
            Some(result) => result.map(JobOutcome::Completed),
            None => {
                let termination = if job.state() == JobState::Running {
                    Some(self.executor.terminate(job).await)
                } else {
                    None
                };

                info!(
                    job = %job.unit().id(),
                    function = %job.unit().function(),
                    interrupted = %job.state(),
                    "deadline expired, returning default"
                );
                if let Err(e) = job.time_out(default.clone()) {
                    warn!(error = %e, "cannot mark job as timed out");
                }

                Ok(JobOutcome::TimedOut {
                    default,
                    termination,
                })
            }
        };

        self.executor.cleanup(job).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use offload_exec::LocalTransport;
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::marshal::{FunctionSpec, Marshaller};
    use crate::runtime::Runtime;

    fn supervisor() -> TimeoutSupervisor {
        let dir = std::env::temp_dir()
            .join(format!("offload-supervisor-{}", std::process::id()))
            .display()
            .to_string();
        TimeoutSupervisor::new(RemoteExecutor::new(
            Arc::new(LocalTransport::new()),
            dir,
            Duration::from_secs(2),
        ))
    }

    fn job(supervisor: &TimeoutSupervisor, source: &str, timeout: Duration) -> RemoteJob {
        let spec = FunctionSpec::new("f", Runtime::shell(), source, &[], &[]).unwrap();
        let unit = Marshaller.marshal(&spec, Value::Null, &BTreeMap::new()).unwrap();
        supervisor
            .executor()
            .prepare_job(unit, Some(Instant::now() + timeout))
    }

    #[tokio::test]
    async fn test_fast_job_completes() {
        let supervisor = supervisor();
        let mut job = job(&supervisor, "f() { offload_return 7; }", Duration::from_secs(10));

        let outcome = supervisor
            .supervise(&mut job, json!("TIMED_OUT"), None)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed(json!(7)));
    }

    #[tokio::test]
    async fn test_slow_job_returns_default() {
        let supervisor = supervisor();
        let mut job = job(
            &supervisor,
            "f() { sleep 5; offload_return '\"real\"'; }",
            Duration::from_millis(300),
        );

        let started = std::time::Instant::now();
        let outcome = supervisor
            .supervise(&mut job, json!("TIMED_OUT"), None)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(
            outcome,
            JobOutcome::TimedOut {
                default: json!("TIMED_OUT"),
                termination: Some(Termination::Confirmed),
            }
        );
        assert_eq!(job.state(), JobState::TimedOut);
        assert!(!std::path::Path::new(job.unit_path()).exists());
    }

    #[tokio::test]
    async fn test_failure_is_not_replaced_by_default() {
        let supervisor = supervisor();
        let mut job = job(&supervisor, "f() { exit 3; }", Duration::from_secs(10));

        let err = supervisor
            .supervise(&mut job, json!("TIMED_OUT"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OffloadError::ResultDecode(_)));
        assert_eq!(job.state(), JobState::Failed);
    }
}
