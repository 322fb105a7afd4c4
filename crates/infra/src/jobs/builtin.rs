//! Jobs every registry carries.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use jobline_core::payload::empty_object;
use jobline_core::{JobId, JobStatus, Payload, PipelineId};

use super::job::{Job, JobInstance, RunContext};
use crate::pipeline::materialize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPipelineInputs {
    pub pipeline_name: String,
    #[serde(default)]
    pub first_job_inputs: Option<JsonValue>,
}

impl Payload for StartPipelineInputs {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPipelineOutputs {
    pub pipeline_id: PipelineId,
}

impl Payload for StartPipelineOutputs {}

/// Bootstrap job enqueued by `trigger`; materializes the pipeline's chain.
pub struct StartPipeline;

#[async_trait]
impl Job for StartPipeline {
    const NAME: &'static str = "StartPipeline";
    type Inputs = StartPipelineInputs;
    type Outputs = StartPipelineOutputs;

    async fn run(&self, job: &mut JobInstance<Self>, ctx: &RunContext) -> anyhow::Result<()> {
        let inputs = job
            .inputs
            .clone()
            .context("StartPipeline needs a pipeline name")?;

        let pipeline = materialize(
            ctx.store.as_ref(),
            &ctx.registry,
            &inputs.pipeline_name,
            job.record,
            inputs.first_job_inputs,
        )
        .await?;

        job.outputs = Some(StartPipelineOutputs {
            pipeline_id: pipeline.id,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousJobs {
    pub previous_jobs_ids: Vec<JobId>,
}

impl Payload for PreviousJobs {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedJobsOutputs {
    pub finished_jobs_outputs: Vec<JsonValue>,
}

impl Payload for FinishedJobsOutputs {}

/// Waits until every listed job is `Done`, then collects their outputs.
///
/// Its own id is skipped. A listed job that does not exist or ended in `Error`
/// fails the wait.
#[derive(Debug, Clone)]
pub struct CheckPreviousJobsFinished {
    pub poll_interval: Duration,
}

impl Default for CheckPreviousJobsFinished {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl Job for CheckPreviousJobsFinished {
    const NAME: &'static str = "CheckPreviousJobsFinished";
    type Inputs = PreviousJobs;
    type Outputs = FinishedJobsOutputs;

    async fn run(&self, job: &mut JobInstance<Self>, ctx: &RunContext) -> anyhow::Result<()> {
        let ids: Vec<JobId> = job
            .inputs
            .as_ref()
            .map(|i| i.previous_jobs_ids.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| Some(*id) != job.record)
            .collect();

        loop {
            let mut outputs = Vec::with_capacity(ids.len());
            for id in &ids {
                let Some(previous) = ctx.store.get_job(*id).await? else {
                    bail!("job {id} does not exist");
                };
                match previous.status {
                    JobStatus::Done => outputs.push(previous.outputs.unwrap_or_else(empty_object)),
                    JobStatus::Error => bail!("job {id} ended in ERROR"),
                    _ => break,
                }
            }

            if outputs.len() == ids.len() {
                job.outputs = Some(FinishedJobsOutputs {
                    finished_jobs_outputs: outputs,
                });
                return Ok(());
            }

            debug!(waiting_on = ids.len() - outputs.len(), "previous jobs not finished yet");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
