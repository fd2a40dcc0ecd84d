//! Remote job state machine

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::info;

use crate::error::OffloadError;
use crate::marshal::RemoteUnit;

/// States of a [`RemoteJob`]
///
/// Transitions only move forward; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Transferring,
    InstallingDeps,
    Running,
    Completed,
    TimedOut,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::TimedOut | JobState::Failed
        )
    }

    /// Check if transition to target state is valid
    #[must_use]
    pub fn can_transition_to(self, target: JobState) -> bool {
        use JobState::{Completed, Failed, InstallingDeps, Pending, Running, TimedOut, Transferring};

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, target),
            (Pending, Transferring)
                | (Transferring, InstallingDeps | Running)
                | (InstallingDeps, Running)
                | (Running, Completed)
                | (_, TimedOut | Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Transferring => "transferring",
            JobState::InstallingDeps => "installing_deps",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::TimedOut => "timed_out",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One execution of a [`RemoteUnit`] on the host
#[derive(Debug)]
pub struct RemoteJob {
    unit: RemoteUnit,
    started_at: DateTime<Utc>,
    deadline: Option<Instant>,
    state: JobState,
    unit_path: String,
    pid_path: String,
    value: Option<Value>,
    cause: Option<String>,
}

impl RemoteJob {
    /// New pending job whose files live under `remote_dir`
    #[must_use]
    pub fn new(unit: RemoteUnit, remote_dir: &str, deadline: Option<Instant>) -> Self {
        let dir = remote_dir.trim_end_matches('/');
        let unit_path = format!("{dir}/{}", unit.file_name());
        let pid_path = format!("{dir}/{}.pid", unit.id());

        Self {
            unit,
            started_at: Utc::now(),
            deadline,
            state: JobState::Pending,
            unit_path,
            pid_path,
            value: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn unit(&self) -> &RemoteUnit {
        &self.unit
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Where the rendered script is written on the host
    #[must_use]
    pub fn unit_path(&self) -> &str {
        &self.unit_path
    }

    /// Where the launched process records its pid
    #[must_use]
    pub fn pid_path(&self) -> &str {
        &self.pid_path
    }

    /// Decoded return value once completed, the default once timed out
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Why the job failed
    #[must_use]
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// Move to `to`
    ///
    /// # Errors
    /// `OffloadError::InvalidTransition` if the move goes backwards or
    /// leaves a terminal state.
    pub fn transition(&mut self, to: JobState) -> Result<(), OffloadError> {
        if !self.state.can_transition_to(to) {
            return Err(OffloadError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        info!(
            job = %self.unit.id(),
            function = %self.unit.function(),
            from = %self.state,
            to = %to,
            "job transition"
        );
        self.state = to;
        Ok(())
    }

    /// Record the decoded return value
    ///
    /// # Errors
    /// `OffloadError::InvalidTransition` unless the job is running
    pub fn complete(&mut self, value: Value) -> Result<(), OffloadError> {
        self.transition(JobState::Completed)?;
        self.value = Some(value);
        Ok(())
    }

    /// Record the deadline expiry and the value returned in its place
    ///
    /// # Errors
    /// `OffloadError::InvalidTransition` if the job already finished
    pub fn time_out(&mut self, default: Value) -> Result<(), OffloadError> {
        self.transition(JobState::TimedOut)?;
        self.value = Some(default);
        Ok(())
    }

    /// Record a failure; a job that already finished keeps its state
    pub fn fail(&mut self, cause: &OffloadError) {
        if self.transition(JobState::Failed).is_ok() {
            self.cause = Some(cause.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::marshal::{FunctionSpec, Marshaller};
    use crate::runtime::Runtime;

    fn job() -> RemoteJob {
        let spec = FunctionSpec::new("noop", Runtime::shell(), "noop() { :; }", &[], &[]).unwrap();
        let unit = Marshaller.marshal(&spec, Value::Null, &BTreeMap::new()).unwrap();
        RemoteJob::new(unit, "/tmp/offload/", None)
    }

    #[test]
    fn test_forward_path() {
        let mut job = job();
        job.transition(JobState::Transferring).unwrap();
        job.transition(JobState::InstallingDeps).unwrap();
        job.transition(JobState::Running).unwrap();
        job.complete(serde_json::json!(42)).unwrap();

        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.value(), Some(&serde_json::json!(42)));
    }

    #[test]
    fn test_install_step_is_optional() {
        assert!(JobState::Transferring.can_transition_to(JobState::Running));
    }

    #[test]
    fn test_no_backwards_transition() {
        let mut job = job();
        job.transition(JobState::Transferring).unwrap();
        job.transition(JobState::Running).unwrap();

        let err = job.transition(JobState::Transferring).unwrap_err();
        assert!(matches!(
            err,
            OffloadError::InvalidTransition {
                from: JobState::Running,
                to: JobState::Transferring
            }
        ));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = job();
        job.transition(JobState::Transferring).unwrap();
        job.transition(JobState::Running).unwrap();
        job.time_out(serde_json::json!("TIMED_OUT")).unwrap();

        job.fail(&OffloadError::ResultDecode("late".into()));
        assert_eq!(job.state(), JobState::TimedOut);
        assert_eq!(job.cause(), None);
        assert!(job.complete(serde_json::json!(1)).is_err());
        assert_eq!(job.value(), Some(&serde_json::json!("TIMED_OUT")));
    }

    #[test]
    fn test_completion_requires_running() {
        let mut job = job();
        assert!(job.complete(Value::Null).is_err());
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn test_paths() {
        let job = job();
        assert!(job.unit_path().starts_with("/tmp/offload/noop-"));
        assert!(job.pid_path().ends_with(".pid"));
        assert!(!job.pid_path().contains("//"));
    }

    #[test]
    fn test_display() {
        assert_eq!(JobState::InstallingDeps.to_string(), "installing_deps");
        assert_eq!(JobState::TimedOut.to_string(), "timed_out");
    }
}
