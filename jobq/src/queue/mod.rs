//! Job queue runtime.
//!
//! This module provides:
//! - `Scheduler`: selects and locks the next startable pending job
//! - `Closer`: finalizes outcomes and cascades them through dependents and retries
//! - `JobManager`: facade for creation, lookups and outcome recording
//! - `Worker`: polling loop handing locked jobs to a `JobRunner`

pub mod cache;
pub mod closer;
pub mod hook;
pub mod manager;
pub mod runner;
pub mod scheduler;
pub mod worker;

pub use cache::JobCache;
pub use closer::{CloseReport, Closer};
pub use hook::StateChangeHook;
pub use manager::JobManager;
pub use runner::{ExecutionOutcome, JobRunner};
pub use scheduler::Scheduler;
pub use worker::Worker;
