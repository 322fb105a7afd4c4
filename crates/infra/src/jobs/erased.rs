//! Type-erased jobs for runtime dispatch by stored name.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use jobline_core::payload::present;
use jobline_core::{
    DomainError, DomainResult, JobId, JobRecord, NextJobInputs, Payload, SchemaKind,
};

use super::job::{Job, JobInstance, RunContext, schema_of};
use super::registry::Registry;
use super::JobError;
use crate::store::JobStore;

/// A registered job type, without its payload types.
pub trait ErasedJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn schema(&self) -> SchemaKind;

    /// Reject stored inputs that do not fit the schema.
    ///
    /// A value without an inputs schema is always rejected; a missing value for
    /// a declared schema only when `require_declared` is set.
    fn check_inputs(&self, inputs: Option<&JsonValue>, require_declared: bool) -> DomainResult<()> {
        self.schema()
            .check_inputs(self.name(), inputs, require_declared)
    }

    /// Rebuild an executable instance from a stored row.
    fn instantiate(&self, record: &JobRecord) -> DomainResult<Box<dyn RunnableJob>>;
}

/// A hydrated job, ready to run.
#[async_trait]
pub trait RunnableJob: Send + Sync {
    fn id(&self) -> JobId;

    fn name(&self) -> &'static str;

    fn previous_job(&self) -> Option<JobId>;

    async fn run(&mut self, ctx: &RunContext) -> anyhow::Result<()>;

    /// Outputs to persist; `None` when the job produced none.
    fn outputs(&self) -> DomainResult<Option<JsonValue>>;

    fn next_job_inputs(&self) -> &NextJobInputs;
}

/// Registry entry for a concrete job type.
pub(crate) struct JobEntry<J: Job> {
    job: Arc<J>,
}

impl<J: Job> JobEntry<J> {
    pub(crate) fn new(job: J) -> Self {
        Self { job: Arc::new(job) }
    }
}

impl<J: Job> ErasedJob for JobEntry<J> {
    fn name(&self) -> &'static str {
        J::NAME
    }

    fn schema(&self) -> SchemaKind {
        schema_of::<J>()
    }

    fn instantiate(&self, record: &JobRecord) -> DomainResult<Box<dyn RunnableJob>> {
        let inputs = match present(record.inputs.clone()) {
            Some(value) if J::Inputs::DECLARED => Some(J::Inputs::from_value(value)?),
            None if J::Inputs::DECLARED => return Err(DomainError::missing_inputs(J::NAME)),
            _ => None,
        };
        let outputs = match present(record.outputs.clone()) {
            Some(value) if J::Outputs::DECLARED => Some(J::Outputs::from_value(value)?),
            _ => None,
        };

        let mut instance = JobInstance::<J>::create(inputs, outputs, record.status, true)?
            .after(record.previous_job);
        instance.record = Some(record.id);

        Ok(Box::new(Hydrated {
            id: record.id,
            job: Arc::clone(&self.job),
            instance,
        }))
    }
}

struct Hydrated<J: Job> {
    id: JobId,
    job: Arc<J>,
    instance: JobInstance<J>,
}

#[async_trait]
impl<J: Job> RunnableJob for Hydrated<J> {
    fn id(&self) -> JobId {
        self.id
    }

    fn name(&self) -> &'static str {
        J::NAME
    }

    fn previous_job(&self) -> Option<JobId> {
        self.instance.previous_job
    }

    async fn run(&mut self, ctx: &RunContext) -> anyhow::Result<()> {
        self.job.run(&mut self.instance, ctx).await
    }

    fn outputs(&self) -> DomainResult<Option<JsonValue>> {
        Ok(present(Some(self.instance.outputs_asdict()?)))
    }

    fn next_job_inputs(&self) -> &NextJobInputs {
        self.instance.next_job_inputs()
    }
}

/// Load a row and turn it into an executable job.
///
/// A row naming an unregistered job, or whose stored payloads do not fit the
/// job's schema, is marked `Error` before the error is returned.
pub async fn hydrate(
    store: &dyn JobStore,
    registry: &Registry,
    id: JobId,
) -> Result<Box<dyn RunnableJob>, JobError> {
    let record = store.get_job(id).await?.ok_or(JobError::NotFound(id))?;

    let built = registry
        .resolve_job(&record.name)
        .map_err(JobError::from)
        .and_then(|entry| entry.instantiate(&record).map_err(JobError::from));

    match built {
        Ok(job) => Ok(job),
        Err(err) => {
            warn!(job_id = %id, job_name = %record.name, error = %err, "job row cannot be hydrated");
            store.mark_failed(id, &err.to_string()).await?;
            Err(err)
        }
    }
}
