//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{ms_to_datetime, opt_ms_to_datetime};
use crate::domain::{Job, JobDependency, JobId, JobState};
use crate::{Error, Result};

/// Job database model.
/// Mirrors a row of the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: i64,
    /// State: new, pending, canceled, running, finished, failed, terminated, incomplete
    pub state: String,
    pub queue: String,
    /// Negated public priority.
    pub priority: i64,
    pub command: String,
    /// JSON array of arguments
    pub args: String,
    pub created_at: i64,
    pub execute_after: i64,
    pub started_at: Option<i64>,
    pub checked_at: Option<i64>,
    pub closed_at: Option<i64>,
    /// Lock owner
    pub worker_name: Option<String>,
    pub original_job_id: Option<i64>,
    pub max_retries: i64,
    /// Seconds; 0 means unbounded
    pub max_runtime: i64,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub exit_code: Option<i64>,
    /// Seconds
    pub runtime: Option<i64>,
    /// Bytes
    pub memory_usage: Option<i64>,
    pub stack_trace: Option<String>,
}

impl JobDbModel {
    /// Build the domain job from this row plus its dependency and retry snapshots.
    pub fn into_job(
        self,
        dependencies: Vec<JobDependency>,
        retry_job_ids: Vec<JobId>,
    ) -> Result<Job> {
        let state = JobState::parse(&self.state).ok_or_else(|| {
            Error::Database(format!("job {} has unknown state '{}'", self.id, self.state))
        })?;
        let args: Vec<String> = serde_json::from_str(&self.args)?;

        Ok(Job {
            id: JobId(self.id),
            state,
            queue: self.queue,
            priority: stored_to_priority(self.priority),
            command: self.command,
            args,
            created_at: ms_to_datetime(self.created_at),
            execute_after: ms_to_datetime(self.execute_after),
            started_at: opt_ms_to_datetime(self.started_at),
            checked_at: opt_ms_to_datetime(self.checked_at),
            closed_at: opt_ms_to_datetime(self.closed_at),
            worker_name: self.worker_name,
            original_job_id: self.original_job_id.map(JobId),
            retry_job_ids,
            dependencies,
            max_retries: u32::try_from(self.max_retries).unwrap_or(0),
            max_runtime: u32::try_from(self.max_runtime).unwrap_or(0),
            output: self.output,
            error_output: self.error_output,
            exit_code: self.exit_code.and_then(|c| i32::try_from(c).ok()),
            runtime: self.runtime,
            memory_usage: self.memory_usage,
            stack_trace: self.stack_trace,
        })
    }
}

/// Dependency edge joined with the dependency's current state.
#[derive(Debug, Clone, FromRow)]
pub struct JobDependencyRow {
    pub id: i64,
    pub state: String,
}

impl JobDependencyRow {
    pub fn into_dependency(self) -> Result<JobDependency> {
        let state = JobState::parse(&self.state).ok_or_else(|| {
            Error::Database(format!(
                "dependency {} has unknown state '{}'",
                self.id, self.state
            ))
        })?;
        Ok(JobDependency {
            id: JobId(self.id),
            state,
        })
    }
}

/// Row of the `job_related_entities` side table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRelatedEntityDbModel {
    pub job_id: i64,
    pub related_class: String,
    pub related_id: String,
}

/// Convert a public priority to its stored (negated) value.
#[inline]
pub fn priority_to_stored(priority: i32) -> i64 {
    -i64::from(priority)
}

/// Convert a stored priority back to its public value.
#[inline]
pub fn stored_to_priority(stored: i64) -> i32 {
    i32::try_from(-stored).unwrap_or(if stored > 0 { i32::MIN } else { i32::MAX })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> JobDbModel {
        JobDbModel {
            id: 3,
            state: "pending".to_string(),
            queue: "default".to_string(),
            priority: -10,
            command: "mail:send".to_string(),
            args: r#"["--to","ops"]"#.to_string(),
            created_at: 1_700_000_000_000,
            execute_after: 1_700_000_000_000,
            started_at: None,
            checked_at: None,
            closed_at: None,
            worker_name: None,
            original_job_id: None,
            max_retries: 2,
            max_runtime: 0,
            output: None,
            error_output: None,
            exit_code: None,
            runtime: None,
            memory_usage: None,
            stack_trace: None,
        }
    }

    #[test]
    fn test_priority_is_stored_negated() {
        assert_eq!(priority_to_stored(10), -10);
        assert_eq!(priority_to_stored(-5), 5);
        assert_eq!(stored_to_priority(-10), 10);
        // Higher public priority sorts first in ascending order.
        assert!(priority_to_stored(10) < priority_to_stored(0));
    }

    #[test]
    fn test_into_job() {
        let job = sample_row().into_job(vec![], vec![]).unwrap();
        assert_eq!(job.id, JobId(3));
        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(job.priority, 10);
        assert_eq!(job.args, vec!["--to".to_string(), "ops".to_string()]);
        assert_eq!(job.max_retries, 2);
        assert!(job.is_startable());
    }

    #[test]
    fn test_into_job_rejects_unknown_state() {
        let mut row = sample_row();
        row.state = "PROCESSING".to_string();
        assert!(matches!(row.into_job(vec![], vec![]), Err(Error::Database(_))));
    }
}
