//! Name → behavior lookup for jobs and pipelines.
//!
//! Built once at startup, then shared behind an `Arc`. Duplicate or dangling
//! names are rejected at registration, never at run time.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use jobline_core::SchemaKind;

use super::builtin::{CheckPreviousJobsFinished, StartPipeline};
use super::erased::{ErasedJob, JobEntry};
use super::job::{Job, schema_of};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("`{0}` is already registered")]
    Duplicate(String),

    #[error("`{0}` is not registered")]
    NotFound(String),

    #[error("invalid pipeline `{name}`: {reason}")]
    InvalidPipeline { name: String, reason: String },
}

/// One step of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStep {
    pub name: &'static str,
    pub schema: SchemaKind,
}

/// A named, static list of jobs run one after another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
    name: String,
    steps: Vec<PipelineStep>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append `J` to the chain.
    pub fn then<J: Job>(mut self) -> Self {
        self.steps.push(PipelineStep {
            name: J::NAME,
            schema: schema_of::<J>(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn first(&self) -> Option<&PipelineStep> {
        self.steps.first()
    }

    pub fn job_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.steps.iter().map(|s| s.name)
    }
}

/// Registered jobs and pipelines.
pub struct Registry {
    jobs: HashMap<&'static str, Arc<dyn ErasedJob>>,
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry holding only the builtin jobs.
    pub fn new() -> Self {
        let mut jobs: HashMap<&'static str, Arc<dyn ErasedJob>> = HashMap::new();
        jobs.insert(StartPipeline::NAME, Arc::new(JobEntry::new(StartPipeline)));
        jobs.insert(
            CheckPreviousJobsFinished::NAME,
            Arc::new(JobEntry::new(CheckPreviousJobsFinished::default())),
        );

        Self {
            jobs,
            pipelines: HashMap::new(),
        }
    }

    pub fn register_job<J: Job>(&mut self, job: J) -> Result<(), RegistryError> {
        if self.jobs.contains_key(J::NAME) {
            return Err(RegistryError::Duplicate(J::NAME.to_string()));
        }
        self.jobs.insert(J::NAME, Arc::new(JobEntry::new(job)));
        Ok(())
    }

    /// Register a pipeline. Every job it names must be registered already.
    pub fn register_pipeline(&mut self, pipeline: PipelineDefinition) -> Result<(), RegistryError> {
        if self.pipelines.contains_key(pipeline.name()) {
            return Err(RegistryError::Duplicate(pipeline.name().to_string()));
        }
        if pipeline.steps().is_empty() {
            return Err(RegistryError::InvalidPipeline {
                name: pipeline.name().to_string(),
                reason: "no jobs".to_string(),
            });
        }
        if let Some(missing) = pipeline.job_names().find(|n| !self.jobs.contains_key(n)) {
            return Err(RegistryError::InvalidPipeline {
                name: pipeline.name().to_string(),
                reason: format!("job `{missing}` is not registered"),
            });
        }

        self.pipelines
            .insert(pipeline.name().to_string(), Arc::new(pipeline));
        Ok(())
    }

    pub fn resolve_job(&self, name: &str) -> Result<Arc<dyn ErasedJob>, RegistryError> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn resolve_pipeline(&self, name: &str) -> Result<Arc<PipelineDefinition>, RegistryError> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Registered job names, sorted.
    pub fn job_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Registered pipeline names, sorted.
    pub fn pipeline_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use jobline_core::{NoSchema, Payload};

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Id {
        id: u64,
    }
    impl Payload for Id {}

    struct Fetch;
    #[async_trait]
    impl Job for Fetch {
        const NAME: &'static str = "Fetch";
        type Inputs = Id;
        type Outputs = NoSchema;
    }

    struct Store;
    #[async_trait]
    impl Job for Store {
        const NAME: &'static str = "Store";
        type Inputs = NoSchema;
        type Outputs = NoSchema;
    }

    #[test]
    fn builtins_are_preregistered() {
        let registry = Registry::new();
        assert_eq!(
            registry.job_names(),
            vec!["CheckPreviousJobsFinished", "StartPipeline"]
        );
    }

    #[test]
    fn duplicate_job_names_are_rejected() {
        let mut registry = Registry::new();
        registry.register_job(Fetch).unwrap();

        assert_eq!(
            registry.register_job(Fetch),
            Err(RegistryError::Duplicate("Fetch".to_string()))
        );
        assert!(registry.register_job(StartPipeline).is_err());
    }

    #[test]
    fn resolve_unknown_name_fails() {
        let registry = Registry::new();
        assert_eq!(
            registry.resolve_job("Nope").err(),
            Some(RegistryError::NotFound("Nope".to_string()))
        );
        assert!(registry.resolve_pipeline("Nope").is_err());
    }

    #[test]
    fn pipelines_reference_registered_jobs() {
        let mut registry = Registry::new();
        registry.register_job(Fetch).unwrap();

        let dangling = PipelineDefinition::new("Sync").then::<Fetch>().then::<Store>();
        assert!(matches!(
            registry.register_pipeline(dangling.clone()),
            Err(RegistryError::InvalidPipeline { .. })
        ));

        registry.register_job(Store).unwrap();
        registry.register_pipeline(dangling.clone()).unwrap();
        assert_eq!(
            registry.register_pipeline(dangling),
            Err(RegistryError::Duplicate("Sync".to_string()))
        );

        let sync = registry.resolve_pipeline("Sync").unwrap();
        assert_eq!(sync.job_names().collect::<Vec<_>>(), vec!["Fetch", "Store"]);
        assert_eq!(sync.first().map(|s| s.schema), Some(SchemaKind::Inputs));
    }

    #[test]
    fn empty_pipelines_are_rejected() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.register_pipeline(PipelineDefinition::new("Empty")),
            Err(RegistryError::InvalidPipeline { .. })
        ));
    }
}
