//! `jobline-core`: job lifecycle building blocks.
//!
//! This crate contains **pure domain** primitives (no storage or runtime concerns).

pub mod error;
pub mod id;
pub mod payload;
pub mod record;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, PipelineId};
pub use payload::{NextJobInputs, NoSchema, Payload, SchemaKind};
pub use record::{JobCounts, JobRecord, NewJob, NewPipeline, PipelineProgress, PipelineRecord};
pub use status::{JobStatus, PipelineStatus};
