//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::JobDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn list_jobs_by_status(&self, status: &str) -> Result<Vec<JobDbModel>>;
    /// Insert a new job. Re-inserting an existing id is a no-op.
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    /// Field-merge the mutable fields of a job.
    ///
    /// Once a row is terminal, only a repeat of the same terminal status is
    /// applied, so retried writes are idempotent and a terminal record never
    /// changes state. Returns whether a row was written.
    async fn save_job(&self, job: &JobDbModel) -> Result<bool>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs_by_status(&self, status: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status = ? ORDER BY created_at",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_job", || async {
            sqlx::query(
                r#"
                INSERT INTO job (id, job_type, asset_ids, status, step, progress, outputs, error, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&job.id)
            .bind(&job.job_type)
            .bind(&job.asset_ids)
            .bind(&job.status)
            .bind(&job.step)
            .bind(job.progress)
            .bind(&job.outputs)
            .bind(&job.error)
            .bind(&job.created_at)
            .bind(&job.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn save_job(&self, job: &JobDbModel) -> Result<bool> {
        retry_on_sqlite_busy("save_job", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO job (id, job_type, asset_ids, status, step, progress, outputs, error, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    step = excluded.step,
                    progress = MAX(job.progress, excluded.progress),
                    outputs = excluded.outputs,
                    error = excluded.error,
                    updated_at = excluded.updated_at
                WHERE job.status NOT IN ('COMPLETED', 'FAILED')
                   OR job.status = excluded.status
                "#,
            )
            .bind(&job.id)
            .bind(&job.job_type)
            .bind(&job.asset_ids)
            .bind(&job.status)
            .bind(&job.step)
            .bind(job.progress)
            .bind(&job.outputs)
            .bind(&job.error)
            .bind(&job.created_at)
            .bind(&job.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }
}
