//! `consume-jobs`: run a job runner against the Postgres store.
//!
//! Applications with their own jobs call [`consume`] with a registry of their
//! own; the bundled binary only knows the builtin jobs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use jobline_infra::runner::config::split_names;
use jobline_infra::{PostgresJobStore, Registry, RunReport, Runner, RunnerConfig};

/// Claim and execute queued jobs until a limit is hit.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "consume-jobs")]
pub struct ConsumeArgs {
    /// Concurrent workers, and the most rows held in progress at once
    #[arg(long = "max_num_workers", default_value_t = 10)]
    pub max_num_workers: usize,

    /// Comma-separated job names never to claim
    #[arg(long, default_value = "")]
    pub exclude: String,

    /// Wall-clock limit in seconds (0 runs forever)
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,

    /// Jobs to process before exiting (0 means no limit)
    #[arg(long = "num_jobs", default_value_t = 0)]
    pub num_jobs: usize,

    /// Postgres connection string
    #[arg(long = "database_url", env = "DATABASE_URL")]
    pub database_url: String,

    /// Reset rows stuck in progress for this many seconds at startup (0 is off).
    /// Must exceed twice the heartbeat interval
    #[arg(long = "reclaim_stale_after", default_value_t = 0)]
    pub reclaim_stale_after: u64,

    /// Seconds between claim renewals for a running job
    #[arg(long = "heartbeat_interval", default_value_t = 10)]
    pub heartbeat_interval: u64,

    /// Connections in the Postgres pool
    #[arg(long = "max_connections", default_value_t = 20)]
    pub max_connections: u32,
}

impl ConsumeArgs {
    pub fn into_config(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_max_num_workers(self.max_num_workers)
            .with_exclude(split_names(&self.exclude))
            .with_timeout(Duration::from_secs(self.timeout))
            .with_num_jobs(self.num_jobs)
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval))
            .with_reclaim_stale_after(Duration::from_secs(self.reclaim_stale_after))
    }
}

/// Connect, make sure the tables exist, then run until a limit is hit.
pub async fn consume(args: &ConsumeArgs, registry: Registry) -> anyhow::Result<RunReport> {
    let config = args.into_config();
    config.validate().context("invalid runner configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(&args.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to create job tables")?;

    info!(jobs = ?registry.job_names(), pipelines = ?registry.pipeline_names(), "registry loaded");

    let runner = Runner::new(Arc::new(store), Arc::new(registry), config)?;
    let report = runner.run().await.context("runner stopped")?;
    Ok(report)
}
