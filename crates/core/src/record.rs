//! Durable row shapes for jobs and pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{JobId, PipelineId};
use crate::status::{JobStatus, PipelineStatus};

/// A stored job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Predecessor in a pipeline chain. The successor holds the link; the
    /// predecessor knows nothing about it.
    pub previous_job: Option<JobId>,
    /// Registered job name, used to resolve behavior.
    pub name: String,
    pub inputs: Option<JsonValue>,
    pub outputs: Option<JsonValue>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn is_not_ready(&self) -> bool {
        self.status == JobStatus::NotReady
    }

    pub fn is_new(&self) -> bool {
        self.status == JobStatus::New
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == JobStatus::InProgress
    }

    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }

    pub fn errored(&self) -> bool {
        self.status == JobStatus::Error
    }
}

/// A job row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub inputs: Option<JsonValue>,
    pub outputs: Option<JsonValue>,
    pub previous_job: Option<JobId>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            status,
            inputs: None,
            outputs: None,
            previous_job: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Option<JsonValue>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Option<JsonValue>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn after(mut self, previous_job: Option<JobId>) -> Self {
        self.previous_job = previous_job;
        self
    }

    pub fn into_record(self, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: self.id,
            previous_job: self.previous_job,
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            status: self.status,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored pipeline row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: PipelineId,
    /// Registered pipeline name.
    pub name: String,
    /// Stored status; only ever `New`. Use `PipelineProgress` for live state.
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn is_new(&self) -> bool {
        self.status == PipelineStatus::New
    }
}

/// A pipeline run about to be materialized, with its chain already linked.
///
/// Every job is `NotReady`; the store flips the first one to `New` inside the
/// same transaction that inserts the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPipeline {
    pub id: PipelineId,
    pub name: String,
    pub jobs: Vec<NewJob>,
}

impl NewPipeline {
    /// Link `steps` into a chain.
    ///
    /// The first step points at `started_by` (the bootstrap job), every later
    /// step at the step before it. Only the first step carries inputs.
    pub fn chain<I>(
        name: impl Into<String>,
        started_by: Option<JobId>,
        steps: I,
        first_inputs: Option<JsonValue>,
    ) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut previous = started_by;
        let mut first_inputs = first_inputs;
        let jobs = steps
            .into_iter()
            .map(|step| {
                let job = NewJob::new(step, JobStatus::NotReady)
                    .with_inputs(first_inputs.take())
                    .after(previous);
                previous = Some(job.id);
                job
            })
            .collect();

        Self {
            id: PipelineId::new(),
            name: name.into(),
            jobs,
        }
    }
}

/// Statuses of a pipeline's jobs, in association order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineProgress {
    pub pipeline_id: PipelineId,
    pub job_statuses: Vec<JobStatus>,
}

impl PipelineProgress {
    /// Every associated job is `Done`.
    pub fn is_done(&self) -> bool {
        !self.job_statuses.is_empty() && self.job_statuses.iter().all(|s| *s == JobStatus::Done)
    }

    /// Any associated job is `Error`.
    pub fn errored(&self) -> bool {
        self.job_statuses.contains(&JobStatus::Error)
    }

    pub fn derived_status(&self) -> PipelineStatus {
        if self.errored() {
            PipelineStatus::Error
        } else if self.is_done() {
            PipelineStatus::Done
        } else if self
            .job_statuses
            .iter()
            .any(|s| matches!(s, JobStatus::InProgress | JobStatus::Done))
        {
            PipelineStatus::InProgress
        } else {
            PipelineStatus::New
        }
    }
}

/// Row counts per job status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub not_ready: usize,
    pub new: usize,
    pub in_progress: usize,
    pub done: usize,
    pub error: usize,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::NotReady => self.not_ready += n,
            JobStatus::New => self.new += n,
            JobStatus::InProgress => self.in_progress += n,
            JobStatus::Done => self.done += n,
            JobStatus::Error => self.error += n,
        }
    }

    pub fn total(&self) -> usize {
        self.not_ready + self.new + self.in_progress + self.done + self.error
    }
}
