//! Job manager: the queue's public facade.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::database::repositories::{JobRepository, SqlxJobRepository};
use crate::database::{self, DbPool, WritePool};
use crate::domain::{ExponentialRetryPolicy, Job, JobId, JobState, NewJob, RelatedEntity, RetryPolicy};
use crate::queue::{CloseReport, Closer, ExecutionOutcome, JobCache, Scheduler, StateChangeHook};
use crate::{Error, Result};

/// Entry point for producers and workers.
pub struct JobManager {
    repo: Arc<dyn JobRepository>,
    cache: Arc<JobCache>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    closer: Closer,
}

impl JobManager {
    /// Build a manager over existing pools.
    pub fn new(
        pool: DbPool,
        write_pool: WritePool,
        clock: Arc<dyn Clock>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        let repo: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool));
        let cache = Arc::new(JobCache::new());
        let scheduler = Scheduler::new(repo.clone(), clock.clone(), cache.clone());
        let closer = Closer::new(write_pool, clock.clone(), retry_policy, cache.clone());

        Self {
            repo,
            cache,
            clock,
            scheduler,
            closer,
        }
    }

    /// Open the configured database, apply migrations and build a manager
    /// on the system clock.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let (pool, write_pool) = database::connect(&config.database_url).await?;
        Ok(Self::new(
            pool,
            write_pool,
            Arc::new(SystemClock),
            Arc::new(ExponentialRetryPolicy::new(config.retry_backoff_base)),
        ))
    }

    /// Install a hook consulted before each close.
    pub fn with_hook(mut self, hook: Arc<dyn StateChangeHook>) -> Self {
        self.closer = self.closer.with_hook(hook);
        self
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repo
    }

    pub fn cache(&self) -> &Arc<JobCache> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn closer(&self) -> &Closer {
        &self.closer
    }

    pub async fn create_job(&self, job: NewJob) -> Result<Job> {
        let created = self.repo.create_job(&job, self.clock.now()).await?;
        debug!(job_id = %created.id, queue = %created.queue, command = %created.command, "Job created");
        Ok(created)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.cache.get_or_load(self.repo.as_ref(), id).await
    }

    /// Return the job with this command and arguments, creating it if needed.
    ///
    /// Concurrent callers converge on one row without a uniqueness
    /// constraint: each inserts a NEW row, and only the caller whose row is
    /// the earliest for the identity promotes it to PENDING. Everyone else
    /// deletes their row and returns the earliest one.
    pub async fn get_or_create_if_not_exists<I, S>(&self, command: &str, args: I) -> Result<Job>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let job = NewJob::new(command, args)?;
        if let Some(existing) = self.repo.find_by_command(job.command(), job.args()).await? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let created = self
            .repo
            .create_job(&job.clone().requiring_confirmation(), now)
            .await?;
        let earliest = self
            .repo
            .find_by_command(job.command(), job.args())
            .await?
            .ok_or_else(|| Error::not_found("Job", created.id))?;

        if earliest.id == created.id {
            let mut created = created;
            created.set_state(JobState::Pending, now)?;
            self.repo.save_job(&created).await?;
            debug!(job_id = %created.id, command = %created.command, "Job created");
            Ok(created)
        } else {
            debug!(job_id = %created.id, existing_job_id = %earliest.id, "Discarding duplicate job");
            self.repo.delete_job(created.id).await?;
            Ok(earliest)
        }
    }

    /// Earliest job with this command and arguments.
    pub async fn find_job_by_command(&self, command: &str, args: &[String]) -> Result<Option<Job>> {
        self.repo.find_by_command(command, args).await
    }

    /// Move a NEW job to PENDING.
    pub async fn confirm(&self, job: &mut Job) -> Result<()> {
        job.set_state(JobState::Pending, self.clock.now())?;
        self.repo.save_job(job).await?;
        self.cache.invalidate(job.id);
        Ok(())
    }

    /// Queues that have jobs waiting or running.
    pub async fn get_available_queue_list(&self) -> Result<Vec<String>> {
        self.repo.list_active_queues().await
    }

    /// PENDING, unlocked jobs in `queue` that are due now.
    pub async fn get_available_jobs_for_queue_count(&self, queue: &str) -> Result<u64> {
        self.repo.count_available_jobs(queue, self.clock.now()).await
    }

    pub async fn add_related_entity(&self, job_id: JobId, entity: &RelatedEntity) -> Result<()> {
        self.repo.add_related_entity(job_id, entity).await
    }

    pub async fn find_jobs_for_related_entity(&self, entity: &RelatedEntity) -> Result<Vec<Job>> {
        self.repo.find_jobs_for_related_entity(entity).await
    }

    /// A NEW, PENDING or RUNNING job with this command linked to `entity`.
    pub async fn find_open_job_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
    ) -> Result<Option<Job>> {
        self.repo
            .find_open_job_for_related_entity(command, entity)
            .await
    }

    pub async fn find_last_jobs_with_error(&self, limit: u32) -> Result<Vec<Job>> {
        self.repo.find_last_jobs_with_error(limit).await
    }

    /// See [`Scheduler::acquire_next`].
    pub async fn acquire_next(
        &self,
        worker_name: &str,
        excluded_ids: Vec<JobId>,
        excluded_queues: &[String],
        restricted_queues: &[String],
    ) -> Result<Option<Job>> {
        self.scheduler
            .acquire_next(worker_name, excluded_ids, excluded_queues, restricted_queues)
            .await
    }

    /// PENDING → RUNNING for a job this worker has locked.
    ///
    /// The write is conditional on the stored row still being PENDING and
    /// locked by `job.worker_name`; a job canceled after it was locked fails
    /// with [`Error::InvalidStateTransition`].
    pub async fn mark_running(&self, job: &mut Job) -> Result<()> {
        let worker_name = job
            .worker_name
            .clone()
            .ok_or_else(|| Error::validation(format!("job {} is not locked", job.id)))?;
        let now = self.clock.now();
        let mut running = job.clone();
        running.set_state(JobState::Running, now)?;

        if !self.repo.mark_running(job.id, &worker_name, now).await? {
            self.cache.invalidate(job.id);
            let stored = self.repo.get_job(job.id).await?;
            if stored.is_pending() {
                return Err(Error::validation(format!(
                    "job {} is not locked by worker {}",
                    job.id, worker_name
                )));
            }
            return Err(Error::InvalidStateTransition {
                job_id: job.id,
                from: stored.state(),
                to: JobState::Running,
                allowed: stored.state().allowed_transitions().to_vec(),
            });
        }

        self.cache.insert(running.clone());
        *job = running;
        Ok(())
    }

    /// Unlock a job this worker locked but never started.
    ///
    /// Returns false when the job is no longer PENDING or is held by another
    /// worker.
    pub async fn release_lock(&self, job: &mut Job) -> Result<bool> {
        let Some(worker_name) = job.worker_name.clone() else {
            return Ok(false);
        };
        let released = self.repo.release_lock(job.id, &worker_name).await?;
        self.cache.invalidate(job.id);
        if released {
            debug!(job_id = %job.id, worker = %worker_name, "Lock released");
            job.worker_name = None;
        }
        Ok(released)
    }

    /// Heartbeat for a running job.
    pub async fn touch(&self, job: &mut Job) -> Result<()> {
        let now = self.clock.now();
        self.repo.touch(job.id, now).await?;
        job.checked_at = Some(now);
        Ok(())
    }

    /// Write the runner's outcome onto `job` and close it with the outcome state.
    pub async fn record_outcome(
        &self,
        job: &mut Job,
        outcome: ExecutionOutcome,
    ) -> Result<CloseReport> {
        let outcome = outcome.validate()?;
        let mut updated = job.clone();
        outcome.apply_to(&mut updated);
        let report = self.closer.close(&mut updated, outcome.state).await?;
        *job = updated;
        Ok(report)
    }

    /// Close `job` with `state`. See [`Closer::close`].
    pub async fn close(&self, job: &mut Job, state: JobState) -> Result<CloseReport> {
        self.closer.close(job, state).await
    }

    pub async fn cancel(&self, job: &mut Job) -> Result<CloseReport> {
        self.closer.close(job, JobState::Canceled).await
    }

    /// Close RUNNING jobs still locked by `worker_name` as INCOMPLETE.
    ///
    /// Meant for worker startup: anything this name still holds was left
    /// behind by a previous process. Originals that stay RUNNING while a
    /// retry is outstanding are skipped; the retry's close settles them.
    /// Returns the recovered job ids.
    pub async fn recover_stale_jobs(&self, worker_name: &str) -> Result<Vec<JobId>> {
        let stale = self.repo.find_running_jobs_for_worker(worker_name).await?;
        let mut recovered = Vec::with_capacity(stale.len());

        for mut job in stale {
            if !job.is_retry_job() && !job.retry_job_ids().is_empty() {
                debug!(job_id = %job.id, retries = job.retry_job_ids().len(), "Original waits on its retry, not recovering");
                continue;
            }
            warn!(job_id = %job.id, worker = %worker_name, "Recovering stale running job");
            self.closer.close(&mut job, JobState::Incomplete).await?;
            recovered.push(job.id);
        }

        if !recovered.is_empty() {
            info!(worker = %worker_name, count = recovered.len(), "Recovered stale jobs");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::TestDb;

    async fn manager(db: &TestDb) -> (JobManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let manager = JobManager::new(
            db.pool.clone(),
            db.write_pool.clone(),
            clock.clone(),
            Arc::new(ExponentialRetryPolicy::default()),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing() {
        let db = TestDb::new().await;
        let (manager, _) = manager(&db).await;

        let first = manager
            .get_or_create_if_not_exists("mail:send", ["42"])
            .await
            .unwrap();
        let second = manager
            .get_or_create_if_not_exists("mail:send", ["42"])
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.state(), JobState::Pending);

        let other = manager
            .get_or_create_if_not_exists("mail:send", ["43"])
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn test_confirm_new_job() {
        let db = TestDb::new().await;
        let (manager, _) = manager(&db).await;

        let mut job = manager
            .create_job(
                NewJob::new("x", Vec::<String>::new())
                    .unwrap()
                    .requiring_confirmation(),
            )
            .await
            .unwrap();
        manager.confirm(&mut job).await.unwrap();

        assert_eq!(
            manager.get_job(job.id).await.unwrap().state(),
            JobState::Pending
        );
    }

    #[tokio::test]
    async fn test_record_outcome_rejects_non_outcome_state() {
        let db = TestDb::new().await;
        let (manager, clock) = manager(&db).await;

        manager
            .create_job(NewJob::new("x", Vec::<String>::new()).unwrap())
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let mut job = manager
            .acquire_next("w", Vec::new(), &[], &[])
            .await
            .unwrap()
            .unwrap();
        manager.mark_running(&mut job).await.unwrap();

        let err = manager
            .record_outcome(&mut job, ExecutionOutcome::new(JobState::Canceled))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(job.state(), JobState::Running);
    }

    #[tokio::test]
    async fn test_mark_running_rejects_job_canceled_after_lock() {
        let db = TestDb::new().await;
        let (manager, clock) = manager(&db).await;
        manager
            .create_job(NewJob::new("x", Vec::<String>::new()).unwrap())
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));

        let mut locked = manager
            .acquire_next("w", Vec::new(), &[], &[])
            .await
            .unwrap()
            .unwrap();
        let mut fresh = manager.repository().get_job(locked.id).await.unwrap();
        manager.cancel(&mut fresh).await.unwrap();

        let err = manager.mark_running(&mut locked).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition {
                from: JobState::Canceled,
                to: JobState::Running,
                ..
            }
        ));
        assert_eq!(locked.state(), JobState::Pending);
        let stored = manager.repository().get_job(locked.id).await.unwrap();
        assert_eq!(stored.state(), JobState::Canceled);
        assert!(stored.started_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_running_requires_the_lock() {
        let db = TestDb::new().await;
        let (manager, _) = manager(&db).await;
        let mut job = manager
            .create_job(NewJob::new("x", Vec::<String>::new()).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            manager.mark_running(&mut job).await,
            Err(Error::Validation(_))
        ));

        job.worker_name = Some("w".to_string());
        assert!(matches!(
            manager.mark_running(&mut job).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(
            manager.repository().get_job(job.id).await.unwrap().state(),
            JobState::Pending
        );
    }

    #[tokio::test]
    async fn test_released_job_can_be_acquired_again() {
        let db = TestDb::new().await;
        let (manager, clock) = manager(&db).await;
        let created = manager
            .create_job(NewJob::new("x", Vec::<String>::new()).unwrap())
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));

        let mut locked = manager
            .acquire_next("w1", Vec::new(), &[], &[])
            .await
            .unwrap()
            .unwrap();
        assert!(
            manager
                .acquire_next("w2", Vec::new(), &[], &[])
                .await
                .unwrap()
                .is_none()
        );

        assert!(manager.release_lock(&mut locked).await.unwrap());
        assert!(locked.worker_name.is_none());
        assert!(!manager.release_lock(&mut locked).await.unwrap());

        let mut again = manager
            .acquire_next("w2", Vec::new(), &[], &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, created.id);
        manager.mark_running(&mut again).await.unwrap();
        assert!(!manager.release_lock(&mut again).await.unwrap());
        assert_eq!(again.worker_name.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_touch_sets_checked_at() {
        let db = TestDb::new().await;
        let (manager, clock) = manager(&db).await;
        let mut job = manager
            .create_job(NewJob::new("x", Vec::<String>::new()).unwrap())
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(30));
        manager.touch(&mut job).await.unwrap();

        assert_eq!(job.checked_at, Some(clock.now()));
        assert_eq!(
            manager.repository().get_job(job.id).await.unwrap().checked_at,
            Some(clock.now())
        );
    }
}
