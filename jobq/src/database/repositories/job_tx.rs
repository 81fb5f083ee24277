//! Transactional operations for jobs.
//!
//! These functions take a bare connection so they can run either on a pooled
//! connection or inside a caller-owned transaction (the closer's
//! `BEGIN IMMEDIATE` cascade). They never commit.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::database::models::{
    JobDbModel, JobDependencyRow, JobRelatedEntityDbModel, priority_to_stored,
};
use crate::database::time::{datetime_to_ms, opt_datetime_to_ms};
use crate::domain::{Job, JobId, NewJob, RelatedEntity};
use crate::{Error, Result};

/// Transactional operations for jobs.
///
/// These methods operate within an existing transaction and do NOT commit.
/// The caller is responsible for committing or rolling back the transaction.
pub struct JobTxOps;

impl JobTxOps {
    /// Load a job with its dependency snapshot and retry chain.
    pub async fn find_job(tx: &mut SqliteConnection, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::hydrate(tx, row).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_job(tx: &mut SqliteConnection, id: JobId) -> Result<Job> {
        Self::find_job(tx, id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    /// Attach dependencies and retry ids to a raw row.
    pub async fn hydrate(tx: &mut SqliteConnection, row: JobDbModel) -> Result<Job> {
        let dependencies = sqlx::query_as::<_, JobDependencyRow>(
            r#"
            SELECT d.dest_job_id AS id, j.state AS state
            FROM job_dependencies d
            JOIN jobs j ON j.id = d.dest_job_id
            WHERE d.source_job_id = ?
            ORDER BY d.dest_job_id
            "#,
        )
        .bind(row.id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(JobDependencyRow::into_dependency)
        .collect::<Result<Vec<_>>>()?;

        let retry_job_ids: Vec<JobId> =
            sqlx::query_scalar("SELECT id FROM jobs WHERE original_job_id = ? ORDER BY id")
                .bind(row.id)
                .fetch_all(&mut *tx)
                .await?;

        row.into_job(dependencies, retry_job_ids)
    }

    pub async fn hydrate_all(tx: &mut SqliteConnection, rows: Vec<JobDbModel>) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(Self::hydrate(tx, row).await?);
        }
        Ok(jobs)
    }

    /// Insert a job and its dependency edges.
    ///
    /// `execute_after` defaults to `now` when the builder left it unset.
    pub async fn insert_job(
        tx: &mut SqliteConnection,
        job: &NewJob,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let args = serde_json::to_string(&job.args)?;
        let execute_after = job.execute_after.unwrap_or(now);

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                state, queue, priority, command, args, created_at, execute_after,
                original_job_id, max_retries, max_runtime
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.state.as_str())
        .bind(&job.queue)
        .bind(priority_to_stored(job.priority))
        .bind(&job.command)
        .bind(args)
        .bind(datetime_to_ms(now))
        .bind(datetime_to_ms(execute_after))
        .bind(job.original_job_id)
        .bind(i64::from(job.max_retries))
        .bind(i64::from(job.max_runtime))
        .execute(&mut *tx)
        .await?;

        let id = JobId(result.last_insert_rowid());

        for dependency in &job.dependencies {
            sqlx::query("INSERT INTO job_dependencies (source_job_id, dest_job_id) VALUES (?, ?)")
                .bind(id)
                .bind(*dependency)
                .execute(&mut *tx)
                .await?;
        }

        Self::get_job(tx, id).await
    }

    /// Persist every mutable column of `job`.
    pub async fn save_job(tx: &mut SqliteConnection, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = ?,
                queue = ?,
                priority = ?,
                execute_after = ?,
                started_at = ?,
                checked_at = ?,
                closed_at = ?,
                worker_name = ?,
                max_retries = ?,
                max_runtime = ?,
                output = ?,
                error_output = ?,
                exit_code = ?,
                runtime = ?,
                memory_usage = ?,
                stack_trace = ?
            WHERE id = ?
            "#,
        )
        .bind(job.state().as_str())
        .bind(&job.queue)
        .bind(priority_to_stored(job.priority))
        .bind(datetime_to_ms(job.execute_after))
        .bind(opt_datetime_to_ms(job.started_at))
        .bind(opt_datetime_to_ms(job.checked_at))
        .bind(opt_datetime_to_ms(job.closed_at))
        .bind(job.worker_name.as_deref())
        .bind(i64::from(job.max_retries))
        .bind(i64::from(job.max_runtime))
        .bind(job.output.as_deref())
        .bind(job.error_output.as_deref())
        .bind(job.exit_code)
        .bind(job.runtime)
        .bind(job.memory_usage)
        .bind(job.stack_trace.as_deref())
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", job.id));
        }
        Ok(())
    }

    /// Persist only what the runner reported; lifecycle columns are left alone.
    pub async fn save_outcome(tx: &mut SqliteConnection, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                output = ?,
                error_output = ?,
                exit_code = ?,
                runtime = ?,
                memory_usage = ?,
                stack_trace = ?
            WHERE id = ?
            "#,
        )
        .bind(job.output.as_deref())
        .bind(job.error_output.as_deref())
        .bind(job.exit_code)
        .bind(job.runtime)
        .bind(job.memory_usage)
        .bind(job.stack_trace.as_deref())
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", job.id));
        }
        Ok(())
    }

    pub async fn delete_job(tx: &mut SqliteConnection, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Earliest job (lowest id) with the given command and arguments, in any state.
    pub async fn find_by_command(
        tx: &mut SqliteConnection,
        command: &str,
        args: &[String],
    ) -> Result<Option<Job>> {
        let args = serde_json::to_string(args)?;
        let row = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE command = ? AND args = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(command)
        .bind(args)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::hydrate(tx, row).await?)),
            None => Ok(None),
        }
    }

    /// Jobs that name `id` as one of their dependencies.
    pub async fn find_incoming_dependencies(
        tx: &mut SqliteConnection,
        id: JobId,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT j.* FROM jobs j
            JOIN job_dependencies d ON d.source_job_id = j.id
            WHERE d.dest_job_id = ?
            ORDER BY j.id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        Self::hydrate_all(tx, rows).await
    }

    /// Incoming dependents for every id in `ids`, as `(dependency, dependent)` pairs.
    pub async fn find_incoming_dependencies_for_ids(
        tx: &mut SqliteConnection,
        ids: &[JobId],
    ) -> Result<Vec<(JobId, Job)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT d.dest_job_id AS dependency_id, j.* FROM jobs j
            JOIN job_dependencies d ON d.source_job_id = j.id
            WHERE d.dest_job_id IN ({})
            ORDER BY d.dest_job_id, j.id
            "#,
            placeholders(ids.len())
        );

        let mut query = sqlx::query_as::<_, DependentRow>(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&mut *tx).await?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in rows {
            let job = Self::hydrate(tx, row.job).await?;
            pairs.push((JobId(row.dependency_id), job));
        }
        Ok(pairs)
    }

    pub async fn add_related_entity(
        tx: &mut SqliteConnection,
        job_id: JobId,
        entity: &RelatedEntity,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_related_entities (job_id, related_class, related_id)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(entity.class())
        .bind(entity.id())
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    pub async fn find_related_entities(
        tx: &mut SqliteConnection,
        job_id: JobId,
    ) -> Result<Vec<RelatedEntity>> {
        let rows = sqlx::query_as::<_, JobRelatedEntityDbModel>(
            "SELECT * FROM job_related_entities WHERE job_id = ? ORDER BY related_class, related_id",
        )
        .bind(job_id)
        .fetch_all(&mut *tx)
        .await?;

        rows.into_iter()
            .map(|row| RelatedEntity::new(row.related_class, row.related_id))
            .collect()
    }
}

/// A dependent job row tagged with the dependency that led to it.
#[derive(sqlx::FromRow)]
struct DependentRow {
    dependency_id: i64,
    #[sqlx(flatten)]
    job: JobDbModel,
}

/// `?, ?, ?` for `n` bind parameters.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
