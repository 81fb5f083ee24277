//! Hook letting callers override the state a job is closed with.

use crate::domain::{Job, JobState};

/// Consulted by the closer before a state is applied.
///
/// Only called for retry jobs and for jobs that have not spawned a retry yet.
/// Return `proposed` to keep the closer's decision.
pub trait StateChangeHook: Send + Sync {
    fn on_state_change(&self, job: &Job, proposed: JobState) -> JobState;
}

impl<F> StateChangeHook for F
where
    F: Fn(&Job, JobState) -> JobState + Send + Sync,
{
    fn on_state_change(&self, job: &Job, proposed: JobState) -> JobState {
        self(job, proposed)
    }
}
