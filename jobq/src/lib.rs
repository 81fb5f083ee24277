//! jobq library crate.
//!
//! A persistent background job queue: jobs are recorded in SQLite, handed to
//! competing workers through an atomic lock, and closed through a cascade that
//! follows job dependencies and retry chains.

pub mod clock;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{QueueConfig, QueueOptions};
pub use domain::{ExponentialRetryPolicy, Job, JobId, JobState, NewJob, RetryPolicy};
pub use error::{Error, Result};
pub use queue::{
    CloseReport, Closer, ExecutionOutcome, JobCache, JobManager, JobRunner, Scheduler,
    StateChangeHook, Worker,
};
