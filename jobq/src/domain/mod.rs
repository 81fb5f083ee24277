//! Domain layer for jobq.
//!
//! This module contains the job lifecycle rules and value objects.

pub mod job;
pub mod value_objects;

pub use job::{DEFAULT_QUEUE, Job, JobDependency, JobId, JobState, MAX_QUEUE_NAME_LENGTH, NewJob};
pub use value_objects::*;

#[cfg(test)]
pub(crate) use job::create_test_job;
