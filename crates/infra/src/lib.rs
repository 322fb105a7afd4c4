//! Infrastructure layer: job storage, registry, pipelines and the runner.
//!
//! ## Modules
//!
//! - `store`: `JobStore` trait with in-memory and Postgres implementations
//! - `jobs`: the `Job` trait, registry, hydration and builtin jobs
//! - `pipeline`: triggering and materializing pipeline chains
//! - `runner`: bounded producer/consumer execution loop

pub mod jobs;
pub mod pipeline;
pub mod runner;
pub mod store;


pub use jobs::{Job, JobInstance, PipelineDefinition, Registry, RunContext};
pub use pipeline::{TriggerError, trigger, trigger_with};
pub use runner::{RunReport, Runner, RunnerConfig, RunnerError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
