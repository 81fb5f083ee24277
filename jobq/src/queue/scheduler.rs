//! Selection and locking of the next runnable job.

use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::Result;
use crate::clock::Clock;
use crate::database::repositories::{CandidateFilter, JobRepository};
use crate::domain::{Job, JobId};
use crate::queue::JobCache;

/// Hands pending jobs to workers.
///
/// There is no in-process coordination between schedulers: the lock is a
/// conditional `UPDATE`, so any number of workers may poll the same store.
pub struct Scheduler {
    repo: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    cache: Arc<JobCache>,
}

impl Scheduler {
    pub fn new(repo: Arc<dyn JobRepository>, clock: Arc<dyn Clock>, cache: Arc<JobCache>) -> Self {
        Self { repo, clock, cache }
    }

    /// Lock and return the best startable pending job, if any.
    ///
    /// Candidates are tried in `(priority, id)` order. A candidate with an
    /// unfinished dependency, or one another worker locked first, is excluded
    /// and the next one is tried. `restricted_queues` is ignored when empty.
    pub async fn acquire_next(
        &self,
        worker_name: &str,
        mut excluded_ids: Vec<JobId>,
        excluded_queues: &[String],
        restricted_queues: &[String],
    ) -> Result<Option<Job>> {
        loop {
            let now = self.clock.now();
            let filter = CandidateFilter {
                excluded_ids: &excluded_ids,
                excluded_queues,
                restricted_queues,
            };

            let Some(mut job) = self.repo.find_next_candidate(now, filter).await? else {
                trace!(worker = %worker_name, "No pending job");
                return Ok(None);
            };

            if !job.is_startable() {
                debug!(job_id = %job.id, worker = %worker_name, "Skipping job with unfinished dependencies");
                excluded_ids.push(job.id);
                self.cache.invalidate(job.id);
                continue;
            }

            if !self.repo.lock_job(job.id, worker_name).await? {
                debug!(job_id = %job.id, worker = %worker_name, "Job locked by another worker");
                excluded_ids.push(job.id);
                continue;
            }

            job.worker_name = Some(worker_name.to_string());
            self.cache.insert(job.clone());
            info!(job_id = %job.id, queue = %job.queue, command = %job.command, worker = %worker_name, "Job locked");
            return Ok(Some(job));
        }
    }
}
