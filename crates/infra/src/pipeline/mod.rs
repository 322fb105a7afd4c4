//! Pipeline triggering.
//!
//! `trigger` only validates and enqueues a `StartPipeline` job. The chain
//! itself is written later, when a runner executes that job and calls
//! [`materialize`]; the store inserts the pipeline, its jobs and their
//! associations in one transaction, so a half-built pipeline is never visible.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use jobline_core::payload::present;
use jobline_core::{DomainError, JobId, JobRecord, NewPipeline, Payload, PipelineRecord};

use crate::jobs::builtin::{StartPipeline, StartPipelineInputs};
use crate::jobs::{JobError, JobInstance, PipelineDefinition, Registry, RegistryError, create_job};
use crate::store::{JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("pipeline `{0}` has no jobs")]
    EmptyPipeline(String),
}

impl From<JobError> for TriggerError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Registry(e) => TriggerError::Registry(e),
            JobError::Domain(e) => TriggerError::Domain(e),
            JobError::Store(e) => TriggerError::Store(e),
            JobError::NotFound(id) => TriggerError::Store(JobStoreError::NotFound(id)),
        }
    }
}

/// Validate inputs for pipeline `name` and enqueue its bootstrap job.
///
/// Returns the bootstrap job's row. Inputs must be given exactly when the
/// first job declares an inputs schema.
pub async fn trigger(
    store: &dyn JobStore,
    registry: &Registry,
    name: &str,
    inputs: Option<JsonValue>,
) -> Result<JobRecord, TriggerError> {
    let inputs = present(inputs);
    check_first_job_inputs(registry, name, inputs.as_ref())?;

    let bootstrap = JobInstance::<StartPipeline>::new(Some(StartPipelineInputs {
        pipeline_name: name.to_string(),
        first_job_inputs: inputs,
    }))?;
    let record = create_job(store, &bootstrap).await?;

    info!(pipeline_name = %name, job_id = %record.id, "pipeline triggered");
    Ok(record)
}

/// [`trigger`] with typed first-job inputs.
pub async fn trigger_with<T: Payload>(
    store: &dyn JobStore,
    registry: &Registry,
    name: &str,
    inputs: &T,
) -> Result<JobRecord, TriggerError> {
    trigger(store, registry, name, Some(inputs.to_value()?)).await
}

/// Write pipeline `name` and its chain of jobs.
///
/// The first job is linked to `started_by` and made runnable; the rest wait
/// `NotReady` for their predecessor to promote them.
pub async fn materialize(
    store: &dyn JobStore,
    registry: &Registry,
    name: &str,
    started_by: Option<JobId>,
    first_job_inputs: Option<JsonValue>,
) -> Result<PipelineRecord, TriggerError> {
    let first_job_inputs = present(first_job_inputs);
    let definition = check_first_job_inputs(registry, name, first_job_inputs.as_ref())?;

    let pipeline = NewPipeline::chain(
        definition.name(),
        started_by,
        definition.job_names(),
        first_job_inputs,
    );
    let record = store.create_pipeline(pipeline).await?;

    info!(
        pipeline_id = %record.id,
        pipeline_name = %record.name,
        job_count = definition.steps().len(),
        "pipeline materialized"
    );
    Ok(record)
}

fn check_first_job_inputs(
    registry: &Registry,
    name: &str,
    inputs: Option<&JsonValue>,
) -> Result<Arc<PipelineDefinition>, TriggerError> {
    let definition = registry.resolve_pipeline(name)?;
    let first = definition
        .first()
        .ok_or_else(|| TriggerError::EmptyPipeline(name.to_string()))?;

    first.schema.check_inputs(first.name, inputs, true)?;
    Ok(definition)
}
