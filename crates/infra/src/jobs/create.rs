//! Job row creation, single and bulk.

use serde_json::Value as JsonValue;
use tracing::info;

use jobline_core::payload::present;
use jobline_core::{JobId, JobRecord, JobStatus, NewJob};

use super::JobError;
use super::job::{Job, JobInstance};
use super::registry::Registry;
use crate::store::{BULK_CREATE_BATCH_SIZE, JobStore};

/// Insert a typed instance as-is.
pub async fn create_job<J: Job>(
    store: &dyn JobStore,
    job: &JobInstance<J>,
) -> Result<JobRecord, JobError> {
    let row = job.to_new_job()?;
    Ok(store.insert_job(row).await?)
}

/// Insert a runnable job by name.
///
/// Fails if `name` is not registered or `inputs` does not match its schema.
pub async fn create_new(
    store: &dyn JobStore,
    registry: &Registry,
    name: &str,
    inputs: Option<JsonValue>,
) -> Result<JobRecord, JobError> {
    let row = checked_row(registry, name, present(inputs), JobStatus::New, true)?;
    Ok(store.insert_job(row).await?)
}

/// Insert a job that waits for `previous_job` to promote it.
///
/// Inputs may be left out even for a declared schema; the predecessor
/// supplies them.
pub async fn create_not_ready(
    store: &dyn JobStore,
    registry: &Registry,
    name: &str,
    inputs: Option<JsonValue>,
    previous_job: Option<JobId>,
) -> Result<JobRecord, JobError> {
    let row = checked_row(registry, name, present(inputs), JobStatus::NotReady, false)?
        .after(previous_job);
    Ok(store.insert_job(row).await?)
}

/// Insert one runnable, unlinked job per element of `inputs`.
///
/// Writes in chunks of [`BULK_CREATE_BATCH_SIZE`]. Every row is validated
/// before the first chunk is written.
pub async fn bulk_create_new(
    store: &dyn JobStore,
    registry: &Registry,
    name: &str,
    inputs: Vec<Option<JsonValue>>,
) -> Result<usize, JobError> {
    let rows = inputs
        .into_iter()
        .map(|i| checked_row(registry, name, present(i), JobStatus::New, true))
        .collect::<Result<Vec<_>, _>>()?;

    let mut created = 0;
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let chunk: Vec<NewJob> = rows.by_ref().take(BULK_CREATE_BATCH_SIZE).collect();
        created += store.insert_many(chunk).await?;
    }

    info!(job_name = %name, created, "bulk created jobs");
    Ok(created)
}

fn checked_row(
    registry: &Registry,
    name: &str,
    inputs: Option<JsonValue>,
    status: JobStatus,
    require_inputs: bool,
) -> Result<NewJob, JobError> {
    let entry = registry.resolve_job(name)?;
    entry.check_inputs(inputs.as_ref(), require_inputs)?;
    Ok(NewJob::new(entry.name(), status).with_inputs(inputs))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use jobline_core::{DomainError, NoSchema, Payload};

    use super::*;
    use crate::store::InMemoryJobStore;

    #[derive(Debug, Serialize, Deserialize)]
    struct Page {
        n: u32,
    }
    impl Payload for Page {}

    struct Crawl;
    #[async_trait]
    impl Job for Crawl {
        const NAME: &'static str = "Crawl";
        type Inputs = Page;
        type Outputs = NoSchema;
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_job(Crawl).unwrap();
        registry
    }

    #[tokio::test]
    async fn create_new_validates_inputs() {
        let store = InMemoryJobStore::new();
        let registry = registry();

        let err = create_new(&store, &registry, "Crawl", None).await.unwrap_err();
        assert!(matches!(err, JobError::Domain(DomainError::MissingInputs(_))));

        let err = create_new(&store, &registry, "Crawl", Some(json!({}))).await.unwrap_err();
        assert!(matches!(err, JobError::Domain(DomainError::MissingInputs(_))));

        let err = create_new(&store, &registry, "Walk", None).await.unwrap_err();
        assert!(matches!(err, JobError::Registry(_)));

        let row = create_new(&store, &registry, "Crawl", Some(json!({ "n": 1 })))
            .await
            .unwrap();
        assert!(row.is_new());
    }

    #[tokio::test]
    async fn create_not_ready_links_the_predecessor() {
        let store = InMemoryJobStore::new();
        let registry = registry();
        let first = create_new(&store, &registry, "Crawl", Some(json!({ "n": 1 })))
            .await
            .unwrap();

        let next = create_not_ready(&store, &registry, "Crawl", None, Some(first.id))
            .await
            .unwrap();

        assert!(next.is_not_ready());
        assert_eq!(next.previous_job, Some(first.id));
        assert_eq!(next.inputs, None);
    }

    #[tokio::test]
    async fn create_job_inserts_a_typed_instance() {
        let store = InMemoryJobStore::new();
        let job = JobInstance::<Crawl>::new(Some(Page { n: 4 })).unwrap();

        let row = create_job(&store, &job).await.unwrap();
        assert_eq!(row.name, "Crawl");
        assert_eq!(row.inputs, Some(json!({ "n": 4 })));
    }

    #[tokio::test]
    async fn bulk_create_writes_in_chunks() {
        let store = Arc::new(InMemoryJobStore::new());
        let registry = registry();
        let inputs: Vec<_> = (0..BULK_CREATE_BATCH_SIZE + 5)
            .map(|n| Some(json!({ "n": n })))
            .collect();

        let created = bulk_create_new(store.as_ref(), &registry, "Crawl", inputs)
            .await
            .unwrap();

        assert_eq!(created, BULK_CREATE_BATCH_SIZE + 5);
        assert_eq!(store.count_by_status().await.unwrap().new, created);
    }

    #[tokio::test]
    async fn bulk_create_writes_nothing_when_a_row_is_invalid() {
        let store = InMemoryJobStore::new();
        let registry = registry();

        let result =
            bulk_create_new(&store, &registry, "Crawl", vec![Some(json!({ "n": 1 })), None]).await;

        assert!(result.is_err());
        assert_eq!(store.count_by_status().await.unwrap().total(), 0);
    }
}
