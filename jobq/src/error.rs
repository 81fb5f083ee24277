//! Crate-wide error types.

use thiserror::Error;

use crate::domain::{JobId, JobState};

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(
        "Invalid state transition for job {job_id}: cannot transition from {from} to {to} (allowed: {})",
        format_states(.allowed)
    )]
    InvalidStateTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
        allowed: Vec<JobState>,
    },

    #[error("Non-allowed final state {0} when closing a job")]
    InvalidCloseState(JobState),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

fn format_states(states: &[JobState]) -> String {
    if states.is_empty() {
        return "none".to_string();
    }
    states
        .iter()
        .map(JobState::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message_lists_allowed_states() {
        let err = Error::InvalidStateTransition {
            job_id: JobId(7),
            from: JobState::New,
            to: JobState::Running,
            allowed: vec![JobState::Pending, JobState::Canceled],
        };
        let msg = err.to_string();
        assert!(msg.contains("job 7"));
        assert!(msg.contains("from new to running"));
        assert!(msg.contains("pending, canceled"));
    }

    #[test]
    fn test_terminal_transition_message() {
        let err = Error::InvalidStateTransition {
            job_id: JobId(1),
            from: JobState::Finished,
            to: JobState::Running,
            allowed: vec![],
        };
        assert!(err.to_string().contains("allowed: none"));
    }
}
