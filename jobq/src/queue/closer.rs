//! Closing jobs and cascading the outcome.
//!
//! A close runs in a single `BEGIN IMMEDIATE` transaction and walks an
//! explicit worklist instead of recursing:
//! - CANCELED travels from a retry job to its original, and from a job to
//!   everything that depends on it.
//! - A failure of an original with retries left spawns a retry job and keeps
//!   the original RUNNING.
//! - A failure of a retry job is replayed on its original.
//! - FINISHED on a retry job finishes its original.
//!
//! Any error rolls the whole cascade back.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::database::repositories::JobTxOps;
use crate::database::{WritePool, begin_immediate};
use crate::domain::{Job, JobId, JobState, NewJob, RetryPolicy};
use crate::queue::{JobCache, StateChangeHook};
use crate::{Error, Result};

/// What a close changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Jobs whose state changed, in the order they were changed.
    pub changed: Vec<JobId>,
    /// Retry job spawned by this close, if any.
    pub retry_job_id: Option<JobId>,
}

impl CloseReport {
    fn record(&mut self, id: JobId) {
        if !self.changed.contains(&id) {
            self.changed.push(id);
        }
    }
}

/// One worklist entry.
#[derive(Debug, Clone, Copy)]
struct Visit {
    job_id: JobId,
    state: JobState,
    /// Index of the visited set this entry belongs to.
    context: usize,
}

/// Closes jobs.
pub struct Closer {
    write_pool: WritePool,
    clock: Arc<dyn Clock>,
    retry_policy: Arc<dyn RetryPolicy>,
    cache: Arc<JobCache>,
    hook: Option<Arc<dyn StateChangeHook>>,
}

impl Closer {
    pub fn new(
        write_pool: WritePool,
        clock: Arc<dyn Clock>,
        retry_policy: Arc<dyn RetryPolicy>,
        cache: Arc<JobCache>,
    ) -> Self {
        Self {
            write_pool,
            clock,
            retry_policy,
            cache,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn StateChangeHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Close `job` with `proposed` and cascade.
    ///
    /// The cascade works on the stored row. Only the outcome fields of the
    /// caller's copy are written, in the same transaction, and the copy is
    /// refreshed from the store after commit. Closing an already closed job
    /// again with the same state is a no-op; any other state is an invalid
    /// transition. On error nothing is persisted and `job` is left untouched.
    pub async fn close(&self, job: &mut Job, proposed: JobState) -> Result<CloseReport> {
        let now = self.clock.now();
        let mut tx = begin_immediate(&self.write_pool).await?;

        let (report, visited, refreshed) = match self.cascade(&mut tx, job, proposed, now).await {
            Ok(result) => result,
            Err(e) => {
                warn!(job_id = %job.id, state = %proposed, error = %e, "Close failed, rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(job_id = %job.id, error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        for id in visited.iter().chain(report.changed.iter()) {
            self.cache.invalidate(*id);
        }
        *job = refreshed;

        info!(
            job_id = %job.id,
            state = %job.state(),
            changed = report.changed.len(),
            retry_job_id = ?report.retry_job_id,
            "Job closed"
        );
        Ok(report)
    }

    async fn cascade(
        &self,
        tx: &mut SqliteConnection,
        job: &Job,
        proposed: JobState,
        now: DateTime<Utc>,
    ) -> Result<(CloseReport, Vec<JobId>, Job)> {
        let stored = JobTxOps::get_job(tx, job.id).await?;
        if stored.is_in_final_state() {
            if stored.state() == proposed {
                debug!(job_id = %stored.id, state = %proposed, "Job already closed");
                return Ok((CloseReport::default(), Vec::new(), stored));
            }
            return Err(Error::InvalidStateTransition {
                job_id: stored.id,
                from: stored.state(),
                to: proposed,
                allowed: stored.state().allowed_transitions().to_vec(),
            });
        }
        JobTxOps::save_outcome(tx, job).await?;

        let mut report = CloseReport::default();
        let mut visited_all = Vec::new();
        let mut contexts: Vec<HashSet<JobId>> = vec![HashSet::new()];
        let mut worklist = vec![Visit {
            job_id: job.id,
            state: proposed,
            context: 0,
        }];

        while let Some(visit) = worklist.pop() {
            if !contexts[visit.context].insert(visit.job_id) {
                continue;
            }
            visited_all.push(visit.job_id);

            let mut current = JobTxOps::get_job(tx, visit.job_id).await?;
            if current.is_in_final_state() {
                debug!(job_id = %current.id, state = %current.state(), "Job already closed, skipping");
                continue;
            }

            let mut state = visit.state;
            if (current.is_retry_job() || current.retry_job_ids().is_empty())
                && let Some(hook) = &self.hook
            {
                state = hook.on_state_change(&current, state);
            }

            match state {
                JobState::Canceled => {
                    current.set_state(JobState::Canceled, now)?;
                    JobTxOps::save_job(tx, &current).await?;
                    report.record(current.id);

                    if let Some(original_id) = current.original_job_id() {
                        worklist.push(Visit {
                            job_id: original_id,
                            state: JobState::Canceled,
                            context: visit.context,
                        });
                    } else {
                        for dependent in JobTxOps::find_incoming_dependencies(tx, current.id).await? {
                            worklist.push(Visit {
                                job_id: dependent.id,
                                state: JobState::Canceled,
                                context: visit.context,
                            });
                        }
                    }
                }

                JobState::Failed | JobState::Terminated | JobState::Incomplete => {
                    if let Some(original_id) = current.original_job_id() {
                        current.set_state(state, now)?;
                        JobTxOps::save_job(tx, &current).await?;
                        report.record(current.id);

                        contexts.push(HashSet::new());
                        worklist.push(Visit {
                            job_id: original_id,
                            state,
                            context: contexts.len() - 1,
                        });
                    } else if current.is_retry_allowed() {
                        let execute_after = self.retry_policy.schedule_next_retry(&current, now);
                        let retry = NewJob::retry_of(&current)?.execute_after(execute_after);
                        let retry = JobTxOps::insert_job(tx, &retry, now).await?;
                        current.add_retry_job(&retry)?;

                        info!(
                            job_id = %current.id,
                            retry_job_id = %retry.id,
                            attempt = current.retry_job_ids().len(),
                            max_retries = current.max_retries,
                            execute_after = %execute_after,
                            "Retry scheduled"
                        );
                        report.record(retry.id);
                        report.retry_job_id = Some(retry.id);
                    } else {
                        current.set_state(state, now)?;
                        JobTxOps::save_job(tx, &current).await?;
                        report.record(current.id);

                        for dependent in JobTxOps::find_incoming_dependencies(tx, current.id).await? {
                            if dependent.is_new() || dependent.is_pending() {
                                worklist.push(Visit {
                                    job_id: dependent.id,
                                    state: JobState::Canceled,
                                    context: visit.context,
                                });
                            }
                        }
                    }
                }

                JobState::Finished => {
                    if let Some(original_id) = current.original_job_id() {
                        let mut original = JobTxOps::get_job(tx, original_id).await?;
                        if !original.is_in_final_state() {
                            original.set_state(JobState::Finished, now)?;
                            JobTxOps::save_job(tx, &original).await?;
                            report.record(original.id);
                        }
                    }

                    current.set_state(JobState::Finished, now)?;
                    JobTxOps::save_job(tx, &current).await?;
                    report.record(current.id);
                }

                other => return Err(Error::InvalidCloseState(other)),
            }
        }

        let refreshed = JobTxOps::get_job(tx, job.id).await?;
        Ok((report, visited_all, refreshed))
    }
}
