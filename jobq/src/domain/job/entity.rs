//! Job entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobState;
use crate::{Error, Result};

/// Maximum length of a queue name.
pub const MAX_QUEUE_NAME_LENGTH: usize = 50;

/// Queue used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Opaque job identifier, assigned by the store on insert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a dependency's state, loaded together with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    pub id: JobId,
    pub state: JobState,
}

/// A persisted job.
///
/// The lifecycle fields (`state`, the retry chain and the dependency snapshot)
/// are only reachable through methods so the state machine cannot be bypassed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub(crate) state: JobState,
    pub queue: String,
    /// Public priority; higher runs first.
    pub priority: i32,
    pub command: String,
    pub args: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Not eligible before this instant.
    pub execute_after: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Heartbeat.
    pub checked_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Worker holding the execution lock.
    pub worker_name: Option<String>,
    pub(crate) original_job_id: Option<JobId>,
    pub(crate) retry_job_ids: Vec<JobId>,
    pub(crate) dependencies: Vec<JobDependency>,
    pub max_retries: u32,
    /// Advisory, in seconds; 0 means unbounded. Enforced by the runner.
    pub max_runtime: u32,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    /// Seconds.
    pub runtime: Option<i64>,
    /// Bytes.
    pub memory_usage: Option<i64>,
    pub stack_trace: Option<String>,
}

impl Job {
    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn original_job_id(&self) -> Option<JobId> {
        self.original_job_id
    }

    pub fn retry_job_ids(&self) -> &[JobId] {
        &self.retry_job_ids
    }

    pub fn dependencies(&self) -> &[JobDependency] {
        &self.dependencies
    }

    pub fn is_new(&self) -> bool {
        self.state == JobState::New
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_in_final_state(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_closed_non_successful(&self) -> bool {
        self.state.is_closed_non_successful()
    }

    pub fn is_retry_job(&self) -> bool {
        self.original_job_id.is_some()
    }

    /// Whether another retry job may be spawned for this job.
    pub fn is_retry_allowed(&self) -> bool {
        self.max_retries > 0 && self.retry_job_ids.len() < self.max_retries as usize
    }

    /// Every dependency has finished.
    pub fn is_startable(&self) -> bool {
        self.dependencies
            .iter()
            .all(|dep| dep.state == JobState::Finished)
    }

    /// Move to `target`, stamping lifecycle timestamps.
    ///
    /// Setting the current state again is a no-op.
    pub fn set_state(&mut self, target: JobState, now: DateTime<Utc>) -> Result<()> {
        if self.state == target {
            return Ok(());
        }

        let target = self.state.transition_to(self.id, target)?;

        match target {
            JobState::Running => {
                self.started_at = Some(now);
                self.checked_at = Some(now);
            }
            JobState::Canceled
            | JobState::Finished
            | JobState::Failed
            | JobState::Terminated
            | JobState::Incomplete => {
                self.closed_at = Some(now);
            }
            JobState::New | JobState::Pending => {}
        }

        self.state = target;
        Ok(())
    }

    /// Record a freshly persisted retry job in this job's retry set.
    pub fn add_retry_job(&mut self, retry: &Job) -> Result<()> {
        if retry.original_job_id != Some(self.id) {
            return Err(Error::validation(format!(
                "job {} is not a retry of job {}",
                retry.id, self.id
            )));
        }
        if self.retry_job_ids.contains(&retry.id) {
            return Err(Error::validation(format!(
                "job {} is already a retry of job {}",
                retry.id, self.id
            )));
        }
        self.retry_job_ids.push(retry.id);
        Ok(())
    }
}

/// A job that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub(crate) command: String,
    pub(crate) args: Vec<String>,
    pub(crate) queue: String,
    pub(crate) priority: i32,
    pub(crate) state: JobState,
    pub(crate) execute_after: Option<DateTime<Utc>>,
    pub(crate) max_retries: u32,
    pub(crate) max_runtime: u32,
    pub(crate) dependencies: Vec<JobId>,
    pub(crate) original_job_id: Option<JobId>,
}

impl NewJob {
    /// Create a confirmed (PENDING) job on the default queue.
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(Error::validation("job command must not be empty"));
        }

        Ok(Self {
            command,
            args: args.into_iter().map(Into::into).collect(),
            queue: DEFAULT_QUEUE.to_string(),
            priority: 0,
            state: JobState::Pending,
            execute_after: None,
            max_retries: 0,
            max_runtime: 0,
            dependencies: Vec::new(),
            original_job_id: None,
        })
    }

    /// Retry of `original`: same command, arguments, queue, priority and max runtime.
    pub fn retry_of(original: &Job) -> Result<Self> {
        let mut retry = Self::new(original.command.clone(), original.args.clone())?
            .with_queue(original.queue.clone())?
            .with_priority(original.priority)
            .with_max_runtime(original.max_runtime);
        retry.set_original_job(original)?;
        Ok(retry)
    }

    /// Create the job in NEW state; it must be confirmed before it can run.
    pub fn requiring_confirmation(mut self) -> Self {
        self.state = JobState::New;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(Error::validation("queue name must not be empty"));
        }
        if queue.chars().count() > MAX_QUEUE_NAME_LENGTH {
            return Err(Error::validation(format!(
                "queue name '{}' exceeds {} characters",
                queue, MAX_QUEUE_NAME_LENGTH
            )));
        }
        self.queue = queue;
        Ok(self)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_runtime(mut self, seconds: u32) -> Self {
        self.max_runtime = seconds;
        self
    }

    pub fn execute_after(mut self, at: DateTime<Utc>) -> Self {
        self.execute_after = Some(at);
        self
    }

    pub fn with_dependency(mut self, dependency: JobId) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Link this job as a retry of `original`.
    ///
    /// Only allowed once, while the job is still PENDING, and only for
    /// originals that are not retries themselves.
    pub fn set_original_job(&mut self, original: &Job) -> Result<()> {
        if self.state != JobState::Pending {
            return Err(Error::validation(format!(
                "a retry job must be pending, got {}",
                self.state
            )));
        }
        if self.original_job_id.is_some() {
            return Err(Error::validation("the original job can only be set once"));
        }
        if original.is_retry_job() {
            return Err(Error::validation(format!(
                "job {} is a retry job and cannot be retried itself",
                original.id
            )));
        }
        self.original_job_id = Some(original.id);
        Ok(())
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn original_job_id(&self) -> Option<JobId> {
        self.original_job_id
    }
}
