//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Covers deterministic caller mistakes (missing inputs, payloads without a
/// declared schema) and payload (de)serialization failures. Storage concerns
/// belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The job declares an inputs schema but no inputs were supplied.
    #[error("`inputs` missing but job `{0}` declares an inputs schema")]
    MissingInputs(String),

    /// Inputs were supplied for a job that does not declare an inputs schema.
    #[error("`inputs` given but job `{0}` does not declare an inputs schema")]
    UnexpectedInputs(String),

    /// A payload is present but the job declares no schema for it.
    #[error("{kind} schema missing for job `{job}`, but a value is present")]
    UndeclaredSchema { job: String, kind: &'static str },

    /// A payload failed to convert to or from its stored form.
    #[error("payload serialization failed: {0}")]
    Serialization(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job was executed without providing a `run` implementation.
    #[error("run is not implemented for job `{0}`")]
    NotImplemented(String),

    /// A status transition outside the lifecycle graph was requested.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl DomainError {
    pub fn missing_inputs(job: impl Into<String>) -> Self {
        Self::MissingInputs(job.into())
    }

    pub fn unexpected_inputs(job: impl Into<String>) -> Self {
        Self::UnexpectedInputs(job.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
