//! Jobs: typed units of work, their registry, and row creation.
//!
//! ## Components
//!
//! - `Job`: trait implemented per job type, with declared payload schemas
//! - `JobInstance`: typed inputs/outputs plus next-job inputs for chaining
//! - `Registry`: name → job and pipeline lookup, built at startup
//! - `hydrate`: stored row → executable job
//! - builtins: `StartPipeline`, `CheckPreviousJobsFinished`

use thiserror::Error;

use jobline_core::{DomainError, JobId};

use crate::store::JobStoreError;

pub mod builtin;
pub mod create;
pub mod erased;
pub mod job;
pub mod registry;

pub use builtin::{CheckPreviousJobsFinished, StartPipeline};
pub use create::{bulk_create_new, create_job, create_new, create_not_ready};
pub use erased::{ErasedJob, RunnableJob, hydrate};
pub use job::{Job, JobInstance, RunContext, schema_of};
pub use registry::{PipelineDefinition, PipelineStep, Registry, RegistryError};

/// Failure to create or load a job row.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("job not found: {0}")]
    NotFound(JobId),
}
