//! Boundary to whatever actually executes a job's command.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::domain::{Job, JobState};
use crate::{Error, Result};

/// Result of running a job, written back onto the job before it is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// FINISHED, FAILED, TERMINATED or INCOMPLETE.
    pub state: JobState,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i32>,
    /// Seconds.
    pub runtime: Option<i64>,
    /// Bytes.
    pub memory_usage: Option<i64>,
    pub stack_trace: Option<String>,
}

impl ExecutionOutcome {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            output: None,
            error_output: None,
            exit_code: None,
            runtime: None,
            memory_usage: None,
            stack_trace: None,
        }
    }

    pub fn finished() -> Self {
        Self::new(JobState::Finished)
    }

    pub fn failed(error_output: impl Into<String>) -> Self {
        Self::new(JobState::Failed).with_error_output(error_output)
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_error_output(mut self, error_output: impl Into<String>) -> Self {
        self.error_output = Some(error_output.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_runtime(mut self, seconds: i64) -> Self {
        self.runtime = Some(seconds);
        self
    }

    pub fn with_memory_usage(mut self, bytes: i64) -> Self {
        self.memory_usage = Some(bytes);
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Reject outcomes whose state a running job cannot end in.
    pub fn validate(self) -> Result<Self> {
        if !self.state.is_run_outcome() {
            return Err(Error::validation(format!(
                "{} is not a valid execution outcome",
                self.state
            )));
        }
        Ok(self)
    }

    /// Copy the recorded fields onto `job`. The state is left to the closer.
    pub fn apply_to(&self, job: &mut Job) {
        job.output = self.output.clone();
        job.error_output = self.error_output.clone();
        job.exit_code = self.exit_code;
        job.runtime = self.runtime;
        job.memory_usage = self.memory_usage;
        job.stack_trace = self.stack_trace.clone();
    }
}

/// Executes a job's command.
///
/// Implementations should honor `cancel` (worker shutdown) and may enforce
/// the job's `max_runtime` by returning TERMINATED.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job, cancel: CancellationToken) -> Result<ExecutionOutcome>;
}
