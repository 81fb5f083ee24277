//! Repository layer for database access.
//!
//! `JobRepository` covers pool-level reads and single-statement writes;
//! `JobTxOps` holds the statements that run inside a caller-owned transaction.

pub mod job;
pub mod job_tx;

pub use job::*;
pub use job_tx::*;
