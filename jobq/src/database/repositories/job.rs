//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::job_tx::{JobTxOps, placeholders};
use crate::database::models::JobDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{Job, JobId, NewJob, RelatedEntity};
use crate::Result;

/// Filters applied when selecting the next candidate job.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateFilter<'a> {
    pub excluded_ids: &'a [JobId],
    pub excluded_queues: &'a [String],
    /// When non-empty, only these queues are considered.
    pub restricted_queues: &'a [String],
}

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: JobId) -> Result<Job>;
    async fn find_job(&self, id: JobId) -> Result<Option<Job>>;
    async fn create_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job>;
    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn delete_job(&self, id: JobId) -> Result<()>;

    /// Earliest job with this command and arguments.
    async fn find_by_command(&self, command: &str, args: &[String]) -> Result<Option<Job>>;

    /// Best eligible PENDING job: unlocked, due before `now`, not filtered out.
    async fn find_next_candidate(
        &self,
        now: DateTime<Utc>,
        filter: CandidateFilter<'_>,
    ) -> Result<Option<Job>>;

    /// Atomically take the execution lock. Returns false if another worker won.
    async fn lock_job(&self, id: JobId, worker_name: &str) -> Result<bool>;

    /// PENDING → RUNNING for a job locked by `worker_name`. Returns false if
    /// the row is no longer pending or held by someone else.
    async fn mark_running(&self, id: JobId, worker_name: &str, at: DateTime<Utc>)
    -> Result<bool>;

    /// Give back the lock on a job that never started.
    async fn release_lock(&self, id: JobId, worker_name: &str) -> Result<bool>;

    async fn find_incoming_dependencies(&self, id: JobId) -> Result<Vec<Job>>;
    async fn find_incoming_dependencies_for_ids(&self, ids: &[JobId])
    -> Result<Vec<(JobId, Job)>>;

    // Queue statistics
    async fn list_active_queues(&self) -> Result<Vec<String>>;
    async fn count_available_jobs(&self, queue: &str, now: DateTime<Utc>) -> Result<u64>;

    // Related entities
    async fn add_related_entity(&self, job_id: JobId, entity: &RelatedEntity) -> Result<()>;
    async fn find_related_entities(&self, job_id: JobId) -> Result<Vec<RelatedEntity>>;
    async fn find_jobs_for_related_entity(&self, entity: &RelatedEntity) -> Result<Vec<Job>>;
    async fn find_open_job_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
    ) -> Result<Option<Job>>;

    /// Most recently closed failed/terminated/incomplete jobs that are not retries.
    async fn find_last_jobs_with_error(&self, limit: u32) -> Result<Vec<Job>>;

    /// Heartbeat: set `checked_at`.
    async fn touch(&self, id: JobId, at: DateTime<Utc>) -> Result<()>;

    /// RUNNING jobs still locked by `worker_name`.
    async fn find_running_jobs_for_worker(&self, worker_name: &str) -> Result<Vec<Job>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn hydrate_rows(&self, rows: Vec<JobDbModel>) -> Result<Vec<Job>> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::hydrate_all(&mut conn, rows).await
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: JobId) -> Result<Job> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::get_job(&mut conn, id).await
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::find_job(&mut conn, id).await
    }

    async fn create_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let created = JobTxOps::insert_job(&mut tx, job, now).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::save_job(&mut conn, job).await
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::delete_job(&mut conn, id).await
    }

    async fn find_by_command(&self, command: &str, args: &[String]) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::find_by_command(&mut conn, command, args).await
    }

    async fn find_next_candidate(
        &self,
        now: DateTime<Utc>,
        filter: CandidateFilter<'_>,
    ) -> Result<Option<Job>> {
        let mut conditions = vec![
            "state = 'pending'".to_string(),
            "worker_name IS NULL".to_string(),
            "execute_after < ?".to_string(),
        ];
        if !filter.excluded_ids.is_empty() {
            conditions.push(format!(
                "id NOT IN ({})",
                placeholders(filter.excluded_ids.len())
            ));
        }
        if !filter.excluded_queues.is_empty() {
            conditions.push(format!(
                "queue NOT IN ({})",
                placeholders(filter.excluded_queues.len())
            ));
        }
        if !filter.restricted_queues.is_empty() {
            conditions.push(format!(
                "queue IN ({})",
                placeholders(filter.restricted_queues.len())
            ));
        }

        let sql = format!(
            "SELECT * FROM jobs WHERE {} ORDER BY priority ASC, id ASC LIMIT 1",
            conditions.join(" AND ")
        );

        let mut query = sqlx::query_as::<_, JobDbModel>(&sql).bind(datetime_to_ms(now));
        for id in filter.excluded_ids {
            query = query.bind(*id);
        }
        for queue in filter.excluded_queues {
            query = query.bind(queue);
        }
        for queue in filter.restricted_queues {
            query = query.bind(queue);
        }

        let mut conn = self.pool.acquire().await?;
        match query.fetch_optional(&mut *conn).await? {
            Some(row) => Ok(Some(JobTxOps::hydrate(&mut conn, row).await?)),
            None => Ok(None),
        }
    }

    async fn lock_job(&self, id: JobId, worker_name: &str) -> Result<bool> {
        retry_on_sqlite_busy("lock_job", || async {
            let result = sqlx::query(
                "UPDATE jobs SET worker_name = ? WHERE id = ? AND worker_name IS NULL AND state = 'pending'",
            )
            .bind(worker_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn mark_running(
        &self,
        id: JobId,
        worker_name: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        retry_on_sqlite_busy("mark_running", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs SET state = 'running', started_at = ?, checked_at = ?
                WHERE id = ? AND state = 'pending' AND worker_name = ?
                "#,
            )
            .bind(datetime_to_ms(at))
            .bind(datetime_to_ms(at))
            .bind(id)
            .bind(worker_name)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn release_lock(&self, id: JobId, worker_name: &str) -> Result<bool> {
        retry_on_sqlite_busy("release_lock", || async {
            let result = sqlx::query(
                "UPDATE jobs SET worker_name = NULL WHERE id = ? AND state = 'pending' AND worker_name = ?",
            )
            .bind(id)
            .bind(worker_name)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn find_incoming_dependencies(&self, id: JobId) -> Result<Vec<Job>> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::find_incoming_dependencies(&mut conn, id).await
    }

    async fn find_incoming_dependencies_for_ids(
        &self,
        ids: &[JobId],
    ) -> Result<Vec<(JobId, Job)>> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::find_incoming_dependencies_for_ids(&mut conn, ids).await
    }

    async fn list_active_queues(&self) -> Result<Vec<String>> {
        let queues = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT queue FROM jobs WHERE state IN ('running', 'new', 'pending') ORDER BY queue",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(queues)
    }

    async fn count_available_jobs(&self, queue: &str, now: DateTime<Utc>) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE queue = ? AND state = 'pending' AND worker_name IS NULL AND execute_after < ?
            "#,
        )
        .bind(queue)
        .bind(datetime_to_ms(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn add_related_entity(&self, job_id: JobId, entity: &RelatedEntity) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::add_related_entity(&mut conn, job_id, entity).await
    }

    async fn find_related_entities(&self, job_id: JobId) -> Result<Vec<RelatedEntity>> {
        let mut conn = self.pool.acquire().await?;
        JobTxOps::find_related_entities(&mut conn, job_id).await
    }

    async fn find_jobs_for_related_entity(&self, entity: &RelatedEntity) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT j.* FROM jobs j
            JOIN job_related_entities r ON r.job_id = j.id
            WHERE r.related_class = ? AND r.related_id = ?
            ORDER BY j.id
            "#,
        )
        .bind(entity.class())
        .bind(entity.id())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_rows(rows).await
    }

    async fn find_open_job_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT j.* FROM jobs j
            JOIN job_related_entities r ON r.job_id = j.id
            WHERE j.command = ?
              AND j.state IN ('new', 'pending', 'running')
              AND r.related_class = ? AND r.related_id = ?
            ORDER BY j.id
            LIMIT 1
            "#,
        )
        .bind(command)
        .bind(entity.class())
        .bind(entity.id())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.hydrate_rows(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_last_jobs_with_error(&self, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM jobs
            WHERE state IN ('failed', 'terminated', 'incomplete')
              AND original_job_id IS NULL
            ORDER BY closed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_rows(rows).await
    }

    async fn touch(&self, id: JobId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET checked_at = ? WHERE id = ?")
            .bind(datetime_to_ms(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_running_jobs_for_worker(&self, worker_name: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE state = 'running' AND worker_name = ? ORDER BY id",
        )
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_rows(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::TestDb;
    use crate::domain::JobState;
    use chrono::Duration;

    fn repo(db: &TestDb) -> SqlxJobRepository {
        SqlxJobRepository::new(db.pool.clone())
    }

    #[tokio::test]
    async fn test_candidate_order_is_priority_then_id() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let now = Utc::now();
        let past = now - Duration::seconds(1);

        let low = repo
            .create_job(&NewJob::new("low", ["1"]).unwrap(), past)
            .await
            .unwrap();
        let high = repo
            .create_job(
                &NewJob::new("high", ["1"]).unwrap().with_priority(10),
                past,
            )
            .await
            .unwrap();

        let first = repo
            .find_next_candidate(now, CandidateFilter::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, high.id);

        let excluded = [high.id];
        let next = repo
            .find_next_candidate(
                now,
                CandidateFilter {
                    excluded_ids: &excluded,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, low.id);
    }

    #[tokio::test]
    async fn test_candidate_respects_execute_after_and_queues() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let now = Utc::now();

        repo.create_job(
            &NewJob::new("later", Vec::<String>::new())
                .unwrap()
                .execute_after(now + Duration::seconds(60)),
            now,
        )
        .await
        .unwrap();
        let mail = repo
            .create_job(
                &NewJob::new("mail", Vec::<String>::new())
                    .unwrap()
                    .with_queue("mail")
                    .unwrap(),
                now - Duration::seconds(1),
            )
            .await
            .unwrap();

        let found = repo
            .find_next_candidate(now, CandidateFilter::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, mail.id);

        let mail_queue = ["mail".to_string()];
        let other_queue = ["other".to_string()];
        assert!(
            repo.find_next_candidate(
                now,
                CandidateFilter {
                    excluded_queues: &mail_queue,
                    ..Default::default()
                }
            )
            .await
            .unwrap()
            .is_none()
        );
        assert!(
            repo.find_next_candidate(
                now,
                CandidateFilter {
                    restricted_queues: &other_queue,
                    ..Default::default()
                }
            )
            .await
            .unwrap()
            .is_none()
        );
    }

    #[tokio::test]
    async fn test_lock_job_only_once() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let job = repo
            .create_job(&NewJob::new("x", Vec::<String>::new()).unwrap(), Utc::now())
            .await
            .unwrap();

        assert!(repo.lock_job(job.id, "w1").await.unwrap());
        assert!(!repo.lock_job(job.id, "w2").await.unwrap());

        let locked = repo.get_job(job.id).await.unwrap();
        assert_eq!(locked.worker_name.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_lock_job_rejects_new_jobs() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let job = repo
            .create_job(
                &NewJob::new("x", Vec::<String>::new())
                    .unwrap()
                    .requiring_confirmation(),
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(job.state(), JobState::New);
        assert!(!repo.lock_job(job.id, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_running_requires_pending_and_lock_owner() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let now = crate::database::time::ms_to_datetime(Utc::now().timestamp_millis());
        let job = repo
            .create_job(&NewJob::new("x", Vec::<String>::new()).unwrap(), now)
            .await
            .unwrap();

        assert!(!repo.mark_running(job.id, "w1", now).await.unwrap());
        assert!(repo.lock_job(job.id, "w1").await.unwrap());
        assert!(!repo.mark_running(job.id, "w2", now).await.unwrap());
        assert!(repo.mark_running(job.id, "w1", now).await.unwrap());
        assert!(!repo.mark_running(job.id, "w1", now).await.unwrap());

        let stored = repo.get_job(job.id).await.unwrap();
        assert_eq!(stored.state(), JobState::Running);
        assert_eq!(stored.started_at, Some(now));
        assert_eq!(stored.checked_at, Some(now));
    }

    #[tokio::test]
    async fn test_release_lock_only_for_pending_owner() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let now = Utc::now();
        let job = repo
            .create_job(&NewJob::new("x", Vec::<String>::new()).unwrap(), now)
            .await
            .unwrap();
        assert!(repo.lock_job(job.id, "w1").await.unwrap());

        assert!(!repo.release_lock(job.id, "w2").await.unwrap());
        assert!(repo.release_lock(job.id, "w1").await.unwrap());
        assert!(repo.get_job(job.id).await.unwrap().worker_name.is_none());

        assert!(repo.lock_job(job.id, "w2").await.unwrap());
        assert!(repo.mark_running(job.id, "w2", now).await.unwrap());
        assert!(!repo.release_lock(job.id, "w2").await.unwrap());
        assert_eq!(
            repo.get_job(job.id).await.unwrap().worker_name.as_deref(),
            Some("w2")
        );
    }

    #[tokio::test]
    async fn test_queue_statistics() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let now = Utc::now();
        let past = now - Duration::seconds(5);

        for queue in ["a", "a", "b"] {
            repo.create_job(
                &NewJob::new("x", [queue]).unwrap().with_queue(queue).unwrap(),
                past,
            )
            .await
            .unwrap();
        }
        let done = repo
            .create_job(
                &NewJob::new("x", Vec::<String>::new())
                    .unwrap()
                    .with_queue("c")
                    .unwrap(),
                past,
            )
            .await
            .unwrap();
        let mut done = done;
        done.set_state(JobState::Canceled, now).unwrap();
        repo.save_job(&done).await.unwrap();

        assert_eq!(
            repo.list_active_queues().await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(repo.count_available_jobs("a", now).await.unwrap(), 2);
        assert_eq!(repo.count_available_jobs("c", now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_related_entities() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let entity = RelatedEntity::new("Order", "42").unwrap();

        let job = repo
            .create_job(&NewJob::new("ship", ["42"]).unwrap(), Utc::now())
            .await
            .unwrap();
        repo.add_related_entity(job.id, &entity).await.unwrap();
        repo.add_related_entity(job.id, &entity).await.unwrap();

        assert_eq!(
            repo.find_related_entities(job.id).await.unwrap(),
            vec![entity.clone()]
        );
        let jobs = repo.find_jobs_for_related_entity(&entity).await.unwrap();
        assert_eq!(jobs.len(), 1);

        let open = repo
            .find_open_job_for_related_entity("ship", &entity)
            .await
            .unwrap();
        assert_eq!(open.map(|j| j.id), Some(job.id));
        assert!(
            repo.find_open_job_for_related_entity("other", &entity)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_touch_updates_checked_at() {
        let db = TestDb::new().await;
        let repo = repo(&db);
        let job = repo
            .create_job(&NewJob::new("x", Vec::<String>::new()).unwrap(), Utc::now())
            .await
            .unwrap();
        let at = crate::database::time::ms_to_datetime(1_800_000_000_000);

        repo.touch(job.id, at).await.unwrap();
        assert_eq!(repo.get_job(job.id).await.unwrap().checked_at, Some(at));
    }
}
