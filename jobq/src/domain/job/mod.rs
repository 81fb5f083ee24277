//! Job aggregate: entity and lifecycle state machine.

mod entity;
mod state;

pub use entity::{DEFAULT_QUEUE, Job, JobDependency, JobId, MAX_QUEUE_NAME_LENGTH, NewJob};
pub use state::JobState;

#[cfg(test)]
pub(crate) use entity::tests::create_test_job;
