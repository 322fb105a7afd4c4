//! Postgres-backed job store.
//!
//! Rows live in three tables: `jobs`, `pipelines` and the `pipeline_jobs`
//! association. [`PostgresJobStore::ensure_schema`] creates them if missing.
//!
//! ## Claiming
//!
//! `claim_one` is a single statement: the inner `SELECT ... FOR UPDATE SKIP
//! LOCKED` picks the oldest unlocked `NEW` row, the outer `UPDATE` flips it to
//! `IN_PROGRESS`. Concurrent consumers skip each other's locked rows instead of
//! blocking, and a row is handed out at most once.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `InvalidRow` |
//! | Database (foreign key violation) | `23503` | `InvalidRow` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::instrument;

use jobline_core::{
    JobCounts, JobId, JobRecord, JobStatus, NewJob, NewPipeline, PipelineId, PipelineRecord,
    PipelineStatus,
};

use super::r#trait::{JobStore, JobStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    previous_job UUID NULL REFERENCES jobs (id),
    name TEXT NOT NULL,
    inputs JSONB NULL,
    outputs JSONB NULL,
    status TEXT NOT NULL,
    error TEXT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS jobs_status_created_idx ON jobs (status, created_at, id);
CREATE INDEX IF NOT EXISTS jobs_previous_job_idx ON jobs (previous_job);

CREATE TABLE IF NOT EXISTS pipelines (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS pipeline_jobs (
    position BIGSERIAL PRIMARY KEY,
    pipeline_id UUID NOT NULL REFERENCES pipelines (id),
    job_id UUID NOT NULL REFERENCES jobs (id),
    UNIQUE (pipeline_id, job_id)
);
"#;

const JOB_COLUMNS: &str =
    "id, previous_job, name, inputs, outputs, status, error, created_at, updated_at";

/// Postgres-backed job store.
///
/// `Send + Sync`; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name), err)]
    async fn insert_job(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (id, previous_job, name, inputs, outputs, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id.as_uuid())
        .bind(job.previous_job.map(|id| *id.as_uuid()))
        .bind(&job.name)
        .bind(&job.inputs)
        .bind(&job.outputs)
        .bind(job.status.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        job_from_row(&row)
    }

    #[instrument(skip(self, jobs), fields(job_count = jobs.len()), err)]
    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<usize, JobStoreError> {
        if jobs.is_empty() {
            return Ok(0);
        }
        let count = jobs.len();

        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO jobs (id, previous_job, name, inputs, outputs, status) ");
        builder.push_values(jobs, |mut b, job| {
            b.push_bind(*job.id.as_uuid())
                .push_bind(job.previous_job.map(|id| *id.as_uuid()))
                .push_bind(job.name)
                .push_bind(job.inputs)
                .push_bind(job.outputs)
                .push_bind(job.status.as_str());
        });

        builder
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_many", e))?;

        Ok(count)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE $1::TEXT IS NULL OR status = $1
            ORDER BY created_at, id
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self) -> Result<JobCounts, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("count_by_status", e))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| map_sqlx_error("count_by_status", e))?;
            counts.add(parse_job_status(&status)?, n as usize);
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn claim_one(&self, exclude: &[String]) -> Result<Option<JobId>, JobStoreError> {
        let claimed: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'IN_PROGRESS', updated_at = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'NEW' AND NOT (name = ANY($1))
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'NEW'
            RETURNING id
            "#,
        )
        .bind(exclude)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_one", e))?;

        Ok(claimed.map(JobId::from_uuid))
    }

    #[instrument(skip(self, outputs), fields(job_id = %id), err)]
    async fn complete(&self, id: JobId, outputs: Option<JsonValue>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'DONE', outputs = COALESCE($2, outputs), updated_at = now()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(id.as_uuid())
        .bind(outputs)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'ERROR', error = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, outputs), fields(job_id = %id), err)]
    async fn save_outputs(&self, id: JobId, outputs: JsonValue) -> Result<(), JobStoreError> {
        let result =
            sqlx::query("UPDATE jobs SET outputs = $2, updated_at = now() WHERE id = $1")
                .bind(id.as_uuid())
                .bind(outputs)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("save_outputs", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, inputs), fields(job_id = %current), err)]
    async fn promote_next(
        &self,
        current: JobId,
        inputs: Option<JsonValue>,
    ) -> Result<bool, JobStoreError> {
        let mut tx = self.begin().await?;

        let waiting: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE previous_job = $1 AND status = 'NOT_READY'
            ORDER BY created_at, id
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(current.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("promote_next", e))?;

        if let Some(next) = waiting {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'NEW', inputs = COALESCE($2, inputs), updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(next)
            .bind(&inputs)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("promote_next", e))?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(true);
        }

        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        Ok(false)
    }

    #[instrument(skip(self, inputs), fields(job_id = %current), err)]
    async fn fan_out_next(
        &self,
        current: JobId,
        inputs: Option<JsonValue>,
    ) -> Result<bool, JobStoreError> {
        let mut tx = self.begin().await?;

        let template: Option<(uuid::Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, name FROM jobs
            WHERE previous_job = $1
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .bind(current.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fan_out_next", e))?;

        let Some((template_id, name)) = template else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        };

        let clone = NewJob::new(name, JobStatus::New)
            .with_inputs(inputs)
            .after(Some(current));

        sqlx::query(
            r#"
            INSERT INTO jobs (id, previous_job, name, inputs, status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(clone.id.as_uuid())
        .bind(current.as_uuid())
        .bind(&clone.name)
        .bind(&clone.inputs)
        .bind(clone.status.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fan_out_next", e))?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_jobs (pipeline_id, job_id)
            SELECT pipeline_id, $2 FROM pipeline_jobs WHERE job_id = $1
            "#,
        )
        .bind(template_id)
        .bind(clone.id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fan_out_next", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn touch(&self, id: JobId) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET updated_at = now() WHERE id = $1 AND status = 'IN_PROGRESS'",
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("touch", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'NEW', updated_at = now()
            WHERE status = 'IN_PROGRESS' AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(
        skip(self, pipeline),
        fields(pipeline_id = %pipeline.id, pipeline_name = %pipeline.name, job_count = pipeline.jobs.len()),
        err
    )]
    async fn create_pipeline(
        &self,
        pipeline: NewPipeline,
    ) -> Result<PipelineRecord, JobStoreError> {
        let Some(first) = pipeline.jobs.first().map(|j| j.id) else {
            return Err(JobStoreError::InvalidRow(format!(
                "pipeline `{}` has no jobs",
                pipeline.name
            )));
        };

        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO pipelines (id, name, status)
            VALUES ($1, $2, $3)
            RETURNING id, name, status, created_at
            "#,
        )
        .bind(pipeline.id.as_uuid())
        .bind(&pipeline.name)
        .bind(PipelineStatus::New.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("create_pipeline", e))?;
        let record = pipeline_from_row(&row)?;

        // Chain rows reference each other, so insert them in chain order.
        for job in &pipeline.jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs (id, previous_job, name, inputs, outputs, status)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.previous_job.map(|id| *id.as_uuid()))
            .bind(&job.name)
            .bind(&job.inputs)
            .bind(&job.outputs)
            .bind(job.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_pipeline", e))?;

            sqlx::query("INSERT INTO pipeline_jobs (pipeline_id, job_id) VALUES ($1, $2)")
                .bind(pipeline.id.as_uuid())
                .bind(job.id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_pipeline", e))?;
        }

        sqlx::query("UPDATE jobs SET status = 'NEW', updated_at = now() WHERE id = $1")
            .bind(first.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_pipeline", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(record)
    }

    #[instrument(skip(self), fields(pipeline_id = %id), err)]
    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<PipelineRecord>, JobStoreError> {
        let row = sqlx::query("SELECT id, name, status, created_at FROM pipelines WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_pipeline", e))?;

        row.as_ref().map(pipeline_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_pipelines(&self) -> Result<Vec<PipelineRecord>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT id, name, status, created_at FROM pipelines ORDER BY created_at, id",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_pipelines", e))?;

        rows.iter().map(pipeline_from_row).collect()
    }

    #[instrument(skip(self), fields(pipeline_id = %id), err)]
    async fn pipeline_jobs(&self, id: PipelineId) -> Result<Vec<JobRecord>, JobStoreError> {
        if self.get_pipeline(id).await?.is_none() {
            return Err(JobStoreError::PipelineNotFound(id));
        }

        let rows = sqlx::query(
            r#"
            SELECT j.id, j.previous_job, j.name, j.inputs, j.outputs, j.status, j.error,
                   j.created_at, j.updated_at
            FROM pipeline_jobs pj
            JOIN jobs j ON j.id = pj.job_id
            WHERE pj.pipeline_id = $1
            ORDER BY pj.position
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pipeline_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") => JobStoreError::InvalidRow(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn parse_job_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|e| JobStoreError::InvalidRow(format!("{e}")))
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::InvalidRow(format!("failed to deserialize job row: {}", e)))?;
    row.try_into()
}

fn pipeline_from_row(row: &PgRow) -> Result<PipelineRecord, JobStoreError> {
    let row = PipelineRow::from_row(row).map_err(|e| {
        JobStoreError::InvalidRow(format!("failed to deserialize pipeline row: {}", e))
    })?;
    row.try_into()
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    previous_job: Option<uuid::Uuid>,
    name: String,
    inputs: Option<JsonValue>,
    outputs: Option<JsonValue>,
    status: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            previous_job: row.try_get("previous_job")?,
            name: row.try_get("name")?,
            inputs: row.try_get("inputs")?,
            outputs: row.try_get("outputs")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            previous_job: row.previous_job.map(JobId::from_uuid),
            name: row.name,
            inputs: row.inputs,
            outputs: row.outputs,
            status: parse_job_status(&row.status)?,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct PipelineRow {
    id: uuid::Uuid,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PipelineRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PipelineRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<PipelineRow> for PipelineRecord {
    type Error = JobStoreError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        Ok(PipelineRecord {
            id: PipelineId::from_uuid(row.id),
            name: row.name,
            status: row
                .status
                .parse()
                .map_err(|e| JobStoreError::InvalidRow(format!("{e}")))?,
            created_at: row.created_at,
        })
    }
}
