use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::time::Instant;

use jobline_core::{
    JobCounts, JobId, JobRecord, JobStatus, NewJob, NewPipeline, PipelineId, PipelineProgress,
    PipelineRecord,
};

/// Maximum rows written by one bulk insert statement.
pub const BULK_CREATE_BATCH_SIZE: usize = 10_000;

/// Job store operation error.
///
/// These are **infrastructure errors**. Claim contention is not one of them: a
/// lost race is reported as "nothing claimed".
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of a timeout-bounded claim attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The row is now `InProgress` and owned by the caller.
    Claimed(JobId),
    /// Nothing eligible within the wait; poll again.
    KeepPolling,
}

/// Durable store for job and pipeline rows.
///
/// ## Implementation Requirements
///
/// - `claim_one` must be atomic: two concurrent callers never receive the same
///   row (conditional update or row lock scoped to a transaction)
/// - `complete` only affects rows currently `InProgress`
/// - `promote_next`, `fan_out_next` and `create_pipeline` run in one
///   transaction each
/// - `touch` and `reclaim_stale` together form a lease on claimed rows
/// - rows are claimed FIFO by creation time
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one row.
    async fn insert_job(&self, job: NewJob) -> Result<JobRecord, JobStoreError>;

    /// Insert many rows in one statement. Callers chunk to
    /// [`BULK_CREATE_BATCH_SIZE`].
    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<usize, JobStoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Rows in creation order, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, JobStoreError>;

    async fn count_by_status(&self) -> Result<JobCounts, JobStoreError>;

    /// Try once to move the oldest `New` row (not named in `exclude`) to
    /// `InProgress`. `None` means nothing was claimed.
    async fn claim_one(&self, exclude: &[String]) -> Result<Option<JobId>, JobStoreError>;

    /// `InProgress -> Done`, attaching `outputs` when given.
    ///
    /// Returns the number of affected rows; 0 if the row was not `InProgress`.
    async fn complete(&self, id: JobId, outputs: Option<JsonValue>) -> Result<u64, JobStoreError>;

    /// Move a row to `Error` with a failure description, whatever its status.
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), JobStoreError>;

    /// Attach outputs to a row without touching its status.
    async fn save_outputs(&self, id: JobId, outputs: JsonValue) -> Result<(), JobStoreError>;

    /// Advance the chain after `current` finished.
    ///
    /// Flips the oldest `NotReady` row whose predecessor is `current` to `New`,
    /// overwriting its inputs when `inputs` is given. Returns `false` when no
    /// `NotReady` successor is left, so promoting twice never adds a row.
    async fn promote_next(
        &self,
        current: JobId,
        inputs: Option<JsonValue>,
    ) -> Result<bool, JobStoreError>;

    /// One more successor for a fan-out.
    ///
    /// Clones the oldest successor of `current` as a `New` row with `inputs`,
    /// keeping its pipeline membership. Called only for the second and later
    /// fan-out items, after `promote_next` took the first. Returns `false`
    /// when `current` has no successor.
    async fn fan_out_next(
        &self,
        current: JobId,
        inputs: Option<JsonValue>,
    ) -> Result<bool, JobStoreError>;

    /// Renew the claim on an `InProgress` row by bumping `updated_at`.
    ///
    /// Returns the affected count; 0 if the row is no longer `InProgress`.
    async fn touch(&self, id: JobId) -> Result<u64, JobStoreError>;

    /// Reset `InProgress` rows last touched before `older_than` to `New`.
    ///
    /// Runners renew their claims with [`touch`](Self::touch) while a job
    /// executes, so only rows whose runner stopped renewing go stale. The
    /// threshold must be well above the renewal interval.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Insert a pipeline, its chained jobs and the associations, then flip the
    /// first job to `New`, atomically.
    async fn create_pipeline(&self, pipeline: NewPipeline)
    -> Result<PipelineRecord, JobStoreError>;

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<PipelineRecord>, JobStoreError>;

    async fn list_pipelines(&self) -> Result<Vec<PipelineRecord>, JobStoreError>;

    /// Jobs associated with a pipeline, in association order.
    async fn pipeline_jobs(&self, id: PipelineId) -> Result<Vec<JobRecord>, JobStoreError>;

    async fn pipeline_progress(&self, id: PipelineId) -> Result<PipelineProgress, JobStoreError> {
        let jobs = self.pipeline_jobs(id).await?;
        Ok(PipelineProgress {
            pipeline_id: id,
            job_statuses: jobs.into_iter().map(|j| j.status).collect(),
        })
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert_job(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        (**self).insert_job(job).await
    }

    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<usize, JobStoreError> {
        (**self).insert_many(jobs).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get_job(id).await
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_jobs(status).await
    }

    async fn count_by_status(&self) -> Result<JobCounts, JobStoreError> {
        (**self).count_by_status().await
    }

    async fn claim_one(&self, exclude: &[String]) -> Result<Option<JobId>, JobStoreError> {
        (**self).claim_one(exclude).await
    }

    async fn complete(&self, id: JobId, outputs: Option<JsonValue>) -> Result<u64, JobStoreError> {
        (**self).complete(id, outputs).await
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), JobStoreError> {
        (**self).mark_failed(id, error).await
    }

    async fn save_outputs(&self, id: JobId, outputs: JsonValue) -> Result<(), JobStoreError> {
        (**self).save_outputs(id, outputs).await
    }

    async fn promote_next(
        &self,
        current: JobId,
        inputs: Option<JsonValue>,
    ) -> Result<bool, JobStoreError> {
        (**self).promote_next(current, inputs).await
    }

    async fn fan_out_next(
        &self,
        current: JobId,
        inputs: Option<JsonValue>,
    ) -> Result<bool, JobStoreError> {
        (**self).fan_out_next(current, inputs).await
    }

    async fn touch(&self, id: JobId) -> Result<u64, JobStoreError> {
        (**self).touch(id).await
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).reclaim_stale(older_than).await
    }

    async fn create_pipeline(
        &self,
        pipeline: NewPipeline,
    ) -> Result<PipelineRecord, JobStoreError> {
        (**self).create_pipeline(pipeline).await
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<PipelineRecord>, JobStoreError> {
        (**self).get_pipeline(id).await
    }

    async fn list_pipelines(&self) -> Result<Vec<PipelineRecord>, JobStoreError> {
        (**self).list_pipelines().await
    }

    async fn pipeline_jobs(&self, id: PipelineId) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).pipeline_jobs(id).await
    }
}

/// Claim one row for processing, polling until `wait` elapses.
///
/// Sleeps `poll_interval` between empty attempts instead of spinning. Only the
/// sleeps are bounded by `wait`; an attempt in flight always finishes, so a row
/// the store has already moved to `InProgress` is never dropped.
pub async fn claim_for_processing(
    store: &dyn JobStore,
    exclude: &[String],
    poll_interval: Duration,
    wait: Duration,
) -> Result<Claim, JobStoreError> {
    let deadline = Instant::now() + wait;
    loop {
        if let Some(id) = store.claim_one(exclude).await? {
            return Ok(Claim::Claimed(id));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(Claim::KeepPolling);
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
