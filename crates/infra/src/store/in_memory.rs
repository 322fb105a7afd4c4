use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use jobline_core::{
    JobCounts, JobId, JobRecord, JobStatus, NewJob, NewPipeline, PipelineId, PipelineRecord,
    PipelineStatus,
};

use super::r#trait::{JobStore, JobStoreError};

#[derive(Debug, Default)]
struct State {
    /// Insertion order is creation order.
    jobs: Vec<JobRecord>,
    pipelines: Vec<PipelineRecord>,
    pipeline_jobs: Vec<(PipelineId, JobId)>,
}

impl State {
    fn job_mut(&mut self, id: JobId) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }
}

/// Move `job` one edge along the lifecycle graph.
fn advance(job: &mut JobRecord, next: JobStatus) -> Result<(), JobStoreError> {
    job.status = job
        .status
        .transition(next)
        .map_err(|e| JobStoreError::InvalidRow(format!("job {}: {e}", job.id)))?;
    job.updated_at = Utc::now();
    Ok(())
}

/// In-memory job store.
///
/// Intended for tests/dev. Every operation runs under one lock, which gives the
/// same atomicity a transaction gives the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<JobRecord, JobStoreError> {
        let mut state = self.lock()?;
        let record = job.into_record(Utc::now());
        state.jobs.push(record.clone());
        Ok(record)
    }

    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<usize, JobStoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let count = jobs.len();
        state.jobs.extend(jobs.into_iter().map(|j| j.into_record(now)));
        Ok(count)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let state = self.lock()?;
        Ok(state.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, JobStoreError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> Result<JobCounts, JobStoreError> {
        let state = self.lock()?;
        let mut counts = JobCounts::default();
        for job in &state.jobs {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn claim_one(&self, exclude: &[String]) -> Result<Option<JobId>, JobStoreError> {
        let mut state = self.lock()?;
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.status == JobStatus::New && !exclude.contains(&j.name))
        else {
            return Ok(None);
        };

        advance(job, JobStatus::InProgress)?;
        Ok(Some(job.id))
    }

    async fn complete(&self, id: JobId, outputs: Option<JsonValue>) -> Result<u64, JobStoreError> {
        let mut state = self.lock()?;
        let Some(job) = state.job_mut(id) else {
            return Ok(0);
        };
        if job.status != JobStatus::InProgress {
            return Ok(0);
        }

        advance(job, JobStatus::Done)?;
        if outputs.is_some() {
            job.outputs = outputs;
        }
        Ok(1)
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        let job = state.job_mut(id).ok_or(JobStoreError::NotFound(id))?;
        // Failure is recorded whatever the current status.
        job.status = JobStatus::Error;
        job.error = Some(error.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn save_outputs(&self, id: JobId, outputs: JsonValue) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        let job = state.job_mut(id).ok_or(JobStoreError::NotFound(id))?;
        job.outputs = Some(outputs);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn promote_next(
        &self,
        current: JobId,
        inputs: Option<JsonValue>,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.lock()?;
        let Some(next) = state
            .jobs
            .iter_mut()
            .find(|j| j.previous_job == Some(current) && j.status == JobStatus::NotReady)
        else {
            return Ok(false);
        };

        advance(next, JobStatus::New)?;
        if inputs.is_some() {
            next.inputs = inputs;
        }
        Ok(true)
    }

    async fn fan_out_next(
        &self,
        current: JobId,
        inputs: Option<JsonValue>,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.lock()?;
        let Some(template) = state
            .jobs
            .iter()
            .find(|j| j.previous_job == Some(current))
            .cloned()
        else {
            return Ok(false);
        };

        let clone = NewJob::new(template.name, JobStatus::New)
            .with_inputs(inputs)
            .after(Some(current))
            .into_record(Utc::now());
        let memberships: Vec<PipelineId> = state
            .pipeline_jobs
            .iter()
            .filter(|(_, job_id)| *job_id == template.id)
            .map(|(pipeline_id, _)| *pipeline_id)
            .collect();
        for pipeline_id in memberships {
            state.pipeline_jobs.push((pipeline_id, clone.id));
        }
        state.jobs.push(clone);
        Ok(true)
    }

    async fn touch(&self, id: JobId) -> Result<u64, JobStoreError> {
        let mut state = self.lock()?;
        match state.job_mut(id) {
            Some(job) if job.status == JobStatus::InProgress => {
                job.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut reclaimed = 0;
        // A reset, not a lifecycle step: the claim is handed back.
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::InProgress && j.updated_at < older_than)
        {
            job.status = JobStatus::New;
            job.updated_at = now;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn create_pipeline(
        &self,
        pipeline: NewPipeline,
    ) -> Result<PipelineRecord, JobStoreError> {
        if pipeline.jobs.is_empty() {
            return Err(JobStoreError::InvalidRow(format!(
                "pipeline `{}` has no jobs",
                pipeline.name
            )));
        }

        let mut state = self.lock()?;
        let now = Utc::now();
        let record = PipelineRecord {
            id: pipeline.id,
            name: pipeline.name,
            status: PipelineStatus::New,
            created_at: now,
        };

        let mut jobs: Vec<JobRecord> = pipeline
            .jobs
            .into_iter()
            .map(|j| j.into_record(now))
            .collect();
        jobs[0].status = JobStatus::New;

        state.pipelines.push(record.clone());
        for job in jobs {
            state.pipeline_jobs.push((record.id, job.id));
            state.jobs.push(job);
        }
        Ok(record)
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<PipelineRecord>, JobStoreError> {
        let state = self.lock()?;
        Ok(state.pipelines.iter().find(|p| p.id == id).cloned())
    }

    async fn list_pipelines(&self) -> Result<Vec<PipelineRecord>, JobStoreError> {
        let state = self.lock()?;
        Ok(state.pipelines.clone())
    }

    async fn pipeline_jobs(&self, id: PipelineId) -> Result<Vec<JobRecord>, JobStoreError> {
        let state = self.lock()?;
        if !state.pipelines.iter().any(|p| p.id == id) {
            return Err(JobStoreError::PipelineNotFound(id));
        }
        Ok(state
            .pipeline_jobs
            .iter()
            .filter(|(pipeline_id, _)| *pipeline_id == id)
            .filter_map(|(_, job_id)| state.jobs.iter().find(|j| j.id == *job_id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    async fn new_job(store: &InMemoryJobStore, name: &str) -> JobId {
        store
            .insert_job(NewJob::new(name, JobStatus::New))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn claims_oldest_first_and_only_once() {
        let store = InMemoryJobStore::new();
        let first = new_job(&store, "A").await;
        let second = new_job(&store, "A").await;

        assert_eq!(store.claim_one(&[]).await.unwrap(), Some(first));
        assert_eq!(store.claim_one(&[]).await.unwrap(), Some(second));
        assert_eq!(store.claim_one(&[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn claim_skips_excluded_names() {
        let store = InMemoryJobStore::new();
        new_job(&store, "A").await;
        let b = new_job(&store, "B").await;

        let exclude = vec!["A".to_string()];
        assert_eq!(store.claim_one(&exclude).await.unwrap(), Some(b));
        assert_eq!(store.claim_one(&exclude).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_a_row_once() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = new_job(&store, "A").await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_one(&[]).await.unwrap() }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(claimed) = handle.await.unwrap() {
                winners.push(claimed);
            }
        }
        assert_eq!(winners, vec![id]);
    }

    #[tokio::test]
    async fn complete_is_guarded_by_in_progress() {
        let store = InMemoryJobStore::new();
        let id = new_job(&store, "A").await;

        assert_eq!(store.complete(id, None).await.unwrap(), 0);

        store.claim_one(&[]).await.unwrap();
        assert_eq!(store.complete(id, Some(json!({ "n": 1 }))).await.unwrap(), 1);
        assert_eq!(store.complete(id, None).await.unwrap(), 0);

        let job = store.get_job(id).await.unwrap().unwrap();
        assert!(job.is_done());
        assert_eq!(job.outputs, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn mark_failed_is_unconditional() {
        let store = InMemoryJobStore::new();
        let id = new_job(&store, "A").await;

        store.mark_failed(id, "boom").await.unwrap();
        store.save_outputs(id, json!({ "partial": true })).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert!(job.errored());
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.outputs, Some(json!({ "partial": true })));
        assert!(matches!(
            store.mark_failed(JobId::new(), "x").await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn promote_next_flips_not_ready_successor() {
        let store = InMemoryJobStore::new();
        let current = new_job(&store, "A").await;
        let next = store
            .insert_job(NewJob::new("B", JobStatus::NotReady).after(Some(current)))
            .await
            .unwrap();

        assert!(store.promote_next(current, Some(json!({ "id": 7 }))).await.unwrap());

        let next = store.get_job(next.id).await.unwrap().unwrap();
        assert!(next.is_new());
        assert_eq!(next.inputs, Some(json!({ "id": 7 })));
    }

    #[tokio::test]
    async fn promote_next_without_successor_ends_the_chain() {
        let store = InMemoryJobStore::new();
        let current = new_job(&store, "A").await;

        assert!(!store.promote_next(current, None).await.unwrap());
        assert!(!store.promote_next(current, Some(json!({ "id": 1 }))).await.unwrap());
        assert_eq!(store.count_by_status().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn repeated_promotion_adds_no_successor() {
        let store = InMemoryJobStore::new();
        let pipeline = NewPipeline::chain("P", None, ["A", "B"], None);
        let first = pipeline.jobs[0].id;
        store.create_pipeline(pipeline).await.unwrap();

        assert!(store.promote_next(first, Some(json!({ "id": 2 }))).await.unwrap());
        assert!(!store.promote_next(first, Some(json!({ "id": 2 }))).await.unwrap());

        let b_rows: Vec<_> = store
            .list_jobs(None)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.name == "B")
            .collect();
        assert_eq!(b_rows.len(), 1);
        assert!(b_rows[0].is_new());
    }

    #[tokio::test]
    async fn fan_out_clones_the_successor_into_its_pipeline() {
        let store = InMemoryJobStore::new();
        let pipeline = NewPipeline::chain("P", None, ["A", "B"], None);
        let first = pipeline.jobs[0].id;
        let record = store.create_pipeline(pipeline).await.unwrap();

        assert!(store.promote_next(first, Some(json!({ "n": 0 }))).await.unwrap());
        for n in 1..3 {
            assert!(store.fan_out_next(first, Some(json!({ "n": n }))).await.unwrap());
        }

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.new, 4);
        assert_eq!(counts.not_ready, 0);
        assert_eq!(store.pipeline_jobs(record.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn fan_out_without_successor_writes_nothing() {
        let store = InMemoryJobStore::new();
        let current = new_job(&store, "A").await;

        assert!(!store.fan_out_next(current, Some(json!({ "n": 1 }))).await.unwrap());
        assert_eq!(store.count_by_status().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn create_pipeline_makes_only_the_first_job_runnable() {
        let store = InMemoryJobStore::new();
        let pipeline = NewPipeline::chain("P", None, ["A", "B", "C"], Some(json!({ "id": 1 })));
        let record = store.create_pipeline(pipeline).await.unwrap();

        let jobs = store.pipeline_jobs(record.id).await.unwrap();
        let statuses: Vec<_> = jobs.iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::New, JobStatus::NotReady, JobStatus::NotReady]
        );
        assert!(record.is_new());
    }

    #[tokio::test]
    async fn create_pipeline_without_jobs_writes_nothing() {
        let store = InMemoryJobStore::new();
        let pipeline = NewPipeline::chain("Empty", None, Vec::<String>::new(), None);

        assert!(store.create_pipeline(pipeline).await.is_err());
        assert!(store.list_pipelines().await.unwrap().is_empty());
        assert_eq!(store.count_by_status().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn reclaim_stale_resets_old_claims() {
        let store = InMemoryJobStore::new();
        let id = new_job(&store, "A").await;
        store.claim_one(&[]).await.unwrap();

        let reclaimed = store
            .reclaim_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(reclaimed, 1);
        assert!(store.get_job(id).await.unwrap().unwrap().is_new());
    }

    #[tokio::test]
    async fn touched_claims_are_not_stale() {
        let store = InMemoryJobStore::new();
        let id = new_job(&store, "A").await;
        store.claim_one(&[]).await.unwrap();
        let threshold = Utc::now() + chrono::Duration::milliseconds(20);

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert_eq!(store.touch(id).await.unwrap(), 1);

        assert_eq!(store.reclaim_stale(threshold).await.unwrap(), 0);
        assert!(store.get_job(id).await.unwrap().unwrap().is_in_progress());
    }

    #[tokio::test]
    async fn touch_ignores_rows_not_in_progress() {
        let store = InMemoryJobStore::new();
        let id = new_job(&store, "A").await;

        assert_eq!(store.touch(id).await.unwrap(), 0);
        assert_eq!(store.touch(JobId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn finished_successors_are_never_reopened() {
        let store = InMemoryJobStore::new();
        let current = new_job(&store, "A").await;
        let done = store
            .insert_job(NewJob::new("B", JobStatus::Done).after(Some(current)))
            .await
            .unwrap();

        // A finished successor is never flipped back to `New`.
        assert!(!store.promote_next(current, None).await.unwrap());
        assert!(store.get_job(done.id).await.unwrap().unwrap().is_done());
        assert_eq!(store.complete(done.id, None).await.unwrap(), 0);
    }
}
