//! Concurrent job runner.
//!
//! ## Design
//!
//! - one producer task claims `New` rows and queues their ids
//! - `max_num_workers` consumer tasks hydrate, run and retire them
//! - a semaphore permit is taken before each claim and released once the row is
//!   persisted, so at most `max_num_workers` claimed rows are in flight
//! - empty claims and empty dequeues are timeout-bounded and simply loop
//! - each job runs in its own task while the worker renews its claim; a panic
//!   is recorded on the row like any other failure
//! - job failures are recorded on the row; they never stop the runner
//! - the wall-clock timeout aborts every task and is a normal exit

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

use jobline_core::payload::present;
use jobline_core::{JobId, NextJobInputs};

use crate::jobs::{Registry, RunContext, RunnableJob, hydrate};
use crate::store::{Claim, JobStore, JobStoreError, claim_for_processing};

pub mod config;

pub use config::RunnerConfig;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid runner configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("runner task failed: {0}")]
    Task(String),
}

/// Counts from one [`Runner::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub enqueued: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The wall-clock timeout ended the run.
    pub timed_out: bool,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicUsize,
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn report(&self, timed_out: bool) -> RunReport {
        RunReport {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            timed_out,
        }
    }
}

/// A claimed row, holding its in-flight permit until dropped.
struct Claimed {
    id: JobId,
    _permit: OwnedSemaphorePermit,
}

struct Shared {
    store: Arc<dyn JobStore>,
    registry: Arc<Registry>,
    config: RunnerConfig,
    counters: Counters,
}

/// Claims, executes and retires jobs with bounded parallelism.
pub struct Runner {
    store: Arc<dyn JobStore>,
    registry: Arc<Registry>,
    config: RunnerConfig,
}

impl Runner {
    /// Fails on invalid configuration; nothing is claimed before `run`.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<Registry>,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        config.validate()?;
        Ok(Self {
            store,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run until `num_jobs` jobs were processed or the timeout elapses.
    ///
    /// Without either limit, runs forever. Jobs still executing at the timeout
    /// stay `InProgress`.
    pub async fn run(&self) -> Result<RunReport, RunnerError> {
        let shared = Arc::new(Shared {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            counters: Counters::default(),
        });
        let config = &self.config;
        info!(
            max_num_workers = config.max_num_workers,
            num_jobs = ?config.num_jobs,
            timeout = ?config.timeout,
            exclude = ?config.exclude,
            "runner started"
        );

        if let Some(after) = config.reclaim_stale_after {
            let older_than = Utc::now()
                - chrono::Duration::from_std(after).map_err(|e| RunnerError::Config(e.to_string()))?;
            let reclaimed = shared.store.reclaim_stale(older_than).await?;
            if reclaimed > 0 {
                warn!(reclaimed, "reset stale in-progress jobs to new");
            }
        }

        let workers = config.max_num_workers;
        let (tx, rx) = mpsc::channel::<Claimed>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let permits = Arc::new(Semaphore::new(workers));

        let mut tasks = JoinSet::new();
        tasks.spawn(produce(shared.clone(), tx, permits));
        for slot in 0..workers {
            tasks.spawn(consume(shared.clone(), rx.clone(), slot));
        }

        let timed_out = match config.timeout {
            Some(limit) => {
                let joined = tokio::time::timeout(limit, join_all(&mut tasks)).await;
                match joined {
                    Ok(joined) => {
                        joined?;
                        false
                    }
                    Err(_) => {
                        tasks.shutdown().await;
                        true
                    }
                }
            }
            None => {
                join_all(&mut tasks).await?;
                false
            }
        };

        let report = shared.counters.report(timed_out);
        info!(
            enqueued = report.enqueued,
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            "runner finished"
        );
        Ok(report)
    }
}

async fn join_all(tasks: &mut JoinSet<()>) -> Result<(), RunnerError> {
    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| RunnerError::Task(e.to_string()))?;
    }
    Ok(())
}

fn limit_reached(count: &AtomicUsize, limit: Option<usize>) -> bool {
    limit.is_some_and(|limit| count.load(Ordering::SeqCst) >= limit)
}

async fn produce(shared: Arc<Shared>, tx: mpsc::Sender<Claimed>, permits: Arc<Semaphore>) {
    let config = &shared.config;
    let claim_timeout = config.effective_claim_timeout();

    loop {
        if limit_reached(&shared.counters.enqueued, config.num_jobs) {
            debug!("enqueue limit reached, producer exiting");
            return;
        }

        // Waits while every worker slot holds a claimed row.
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };

        match claim_for_processing(
            shared.store.as_ref(),
            &config.exclude,
            config.poll_interval,
            claim_timeout,
        )
        .await
        {
            Ok(Claim::Claimed(id)) => {
                if tx.send(Claimed { id, _permit: permit }).await.is_err() {
                    return;
                }
                let enqueued = shared.counters.enqueued.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(job_id = %id, enqueued, "job enqueued");
            }
            Ok(Claim::KeepPolling) => {
                debug!("no job to process");
            }
            Err(err) => {
                error!(error = %err, "claiming a job failed");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }
}

async fn consume(shared: Arc<Shared>, rx: Arc<Mutex<mpsc::Receiver<Claimed>>>, slot: usize) {
    let config = &shared.config;

    loop {
        if limit_reached(&shared.counters.processed, config.num_jobs) {
            debug!(slot, "process limit reached, worker exiting");
            return;
        }

        let next = tokio::time::timeout(config.dequeue_timeout, async {
            rx.lock().await.recv().await
        })
        .await;

        let claimed = match next {
            Err(_) => continue,
            Ok(None) => {
                debug!(slot, "queue closed, worker exiting");
                return;
            }
            Ok(Some(claimed)) => claimed,
        };

        debug!(slot, job_id = %claimed.id, "processing job");
        let span = info_span!("job", job_id = %claimed.id, job_name = field::Empty);
        let succeeded = shared.process(claimed.id).instrument(span).await;

        let counter = if succeeded {
            &shared.counters.succeeded
        } else {
            &shared.counters.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        shared.counters.processed.fetch_add(1, Ordering::SeqCst);
        drop(claimed);
    }
}

/// How a job's `run` ended.
enum Outcome {
    /// `run` returned; the instance keeps whatever it staged.
    Returned(Box<dyn RunnableJob>, anyhow::Result<()>),
    /// `run` panicked and the instance is gone.
    Panicked(anyhow::Error),
}

impl Shared {
    /// Run one claimed job and persist its result. Returns whether it ended `Done`.
    async fn process(&self, id: JobId) -> bool {
        let job = match hydrate(self.store.as_ref(), &self.registry, id).await {
            Ok(job) => job,
            Err(err) => {
                error!(job_id = %id, error = %err, "failed to load job");
                return false;
            }
        };
        let name = job.name();
        Span::current().record("job_name", name);

        match self.execute(id, job).await {
            Outcome::Returned(job, Ok(())) => match self.finish(job.as_ref()).await {
                Ok(()) => {
                    info!(job_id = %id, job_name = name, "job done");
                    true
                }
                Err(err) => {
                    self.fail(id, name, &err, Some(job.as_ref())).await;
                    false
                }
            },
            Outcome::Returned(job, Err(err)) => {
                self.fail(id, name, &err, Some(job.as_ref())).await;
                false
            }
            Outcome::Panicked(err) => {
                self.fail(id, name, &err, None).await;
                false
            }
        }
    }

    /// Run `job` in its own task, renewing the claim every heartbeat until it
    /// returns.
    async fn execute(&self, id: JobId, mut job: Box<dyn RunnableJob>) -> Outcome {
        let ctx = RunContext::new(self.store.clone(), self.registry.clone());

        // Dropping the set aborts the job, so a runner timeout never leaves it
        // running detached.
        let mut running = JoinSet::new();
        running.spawn(
            async move {
                let result = job.run(&ctx).await;
                (job, result)
            }
            .in_current_span(),
        );

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                joined = running.join_next() => {
                    return match joined {
                        Some(Ok((job, result))) => Outcome::Returned(job, result),
                        Some(Err(err)) => Outcome::Panicked(anyhow::anyhow!(
                            "job panicked: {}",
                            panic_message(err)
                        )),
                        None => Outcome::Panicked(anyhow::anyhow!("job task was lost")),
                    };
                }
                _ = heartbeat.tick() => match self.store.touch(id).await {
                    Ok(0) => warn!(job_id = %id, "claim no longer held while running"),
                    Ok(_) => debug!(job_id = %id, "claim renewed"),
                    Err(err) => warn!(job_id = %id, error = %err, "failed to renew claim"),
                },
            }
        }
    }

    /// Promote successors, then store outputs and mark the row `Done`.
    async fn finish(&self, job: &dyn RunnableJob) -> anyhow::Result<()> {
        let id = job.id();

        if job.previous_job().is_some() {
            match job.next_job_inputs() {
                NextJobInputs::Many(items) if !items.is_empty() => {
                    self.fan_out(id, items).await?;
                }
                single => {
                    let promoted = self
                        .store
                        .promote_next(id, present(Some(single.as_value())))
                        .await?;
                    if !promoted {
                        debug!(job_id = %id, "end of chain");
                    }
                }
            }
        }

        let outputs = job.outputs()?;
        if self.store.complete(id, outputs).await? == 0 {
            warn!(job_id = %id, "job was no longer in progress when completed");
        }
        Ok(())
    }

    /// The first item promotes the waiting successor; every further item gets
    /// a clone of it.
    async fn fan_out(&self, id: JobId, items: &[serde_json::Value]) -> anyhow::Result<()> {
        let Some((first, rest)) = items.split_first() else {
            return Ok(());
        };

        if !self.store.promote_next(id, present(Some(first.clone()))).await? {
            debug!(job_id = %id, "no successor waiting, fan-out skipped");
            return Ok(());
        }
        for inputs in rest {
            self.store.fan_out_next(id, present(Some(inputs.clone()))).await?;
        }
        debug!(job_id = %id, successors = items.len(), "fanned out");
        Ok(())
    }

    /// Mark the row `Error`, keeping whatever outputs the job produced.
    async fn fail(
        &self,
        id: JobId,
        name: &str,
        err: &anyhow::Error,
        job: Option<&dyn RunnableJob>,
    ) {
        warn!(job_id = %id, job_name = name, error = %err, "job failed");

        if let Err(store_err) = self.store.mark_failed(id, &format!("{err:?}")).await {
            error!(job_id = %id, error = %store_err, "failed to mark job as failed");
            return;
        }

        match job.map(|job| job.outputs()) {
            Some(Ok(Some(outputs))) => {
                if let Err(store_err) = self.store.save_outputs(id, outputs).await {
                    warn!(job_id = %id, error = %store_err, "failed to save partial outputs");
                }
            }
            Some(Ok(None)) | None => {}
            Some(Err(ser_err)) => {
                warn!(job_id = %id, error = %ser_err, "partial outputs are not serializable");
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
        Err(err) => err.to_string(),
    }
}
