use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobline_core::{JobStatus, NewJob, NoSchema};
use jobline_infra::jobs::{Job, JobInstance, Registry, RunContext, bulk_create_new};
use jobline_infra::store::{InMemoryJobStore, JobStore};
use jobline_infra::{Runner, RunnerConfig};
use tokio::runtime::Runtime;

struct Noop;

#[async_trait]
impl Job for Noop {
    const NAME: &'static str = "Noop";
    type Inputs = NoSchema;
    type Outputs = NoSchema;

    async fn run(&self, _job: &mut JobInstance<Self>, _ctx: &RunContext) -> anyhow::Result<()> {
        Ok(())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn registry() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register_job(Noop).expect("register Noop");
    Arc::new(registry)
}

async fn seeded_store(registry: &Registry, rows: usize) -> Arc<InMemoryJobStore> {
    let store = Arc::new(InMemoryJobStore::new());
    bulk_create_new(store.as_ref(), registry, Noop::NAME, vec![None; rows])
        .await
        .expect("seed rows");
    store
}

/// Claim latency grows with the queue it scans.
fn bench_claim_one(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_one");

    for queued in [10, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(queued), queued, |b, &queued| {
            b.to_async(&rt).iter(|| async move {
                let store = InMemoryJobStore::new();
                for _ in 0..queued {
                    store
                        .insert_job(NewJob::new(Noop::NAME, JobStatus::New))
                        .await
                        .expect("insert");
                }
                black_box(store.claim_one(&[]).await.expect("claim"))
            });
        });
    }

    group.finish();
}

/// End-to-end throughput of trivial jobs across worker counts.
fn bench_runner_throughput(c: &mut Criterion) {
    let rt = runtime();
    let registry = registry();
    let mut group = c.benchmark_group("runner_throughput");
    group.sample_size(20);

    const JOBS: usize = 200;
    group.throughput(Throughput::Elements(JOBS as u64));

    for workers in [1, 4, 16].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(workers), workers, |b, &workers| {
            let registry = registry.clone();
            b.to_async(&rt).iter(|| {
                let registry = registry.clone();
                async move {
                    let store = seeded_store(&registry, JOBS).await;
                    let config = RunnerConfig::default()
                        .with_max_num_workers(workers)
                        .with_num_jobs(JOBS)
                        .with_poll_interval(Duration::from_millis(1))
                        .with_claim_timeout(Duration::from_millis(5))
                        .with_dequeue_timeout(Duration::from_millis(1));
                    let runner = Runner::new(store, registry, config).expect("runner");
                    black_box(runner.run().await.expect("run"))
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_claim_one, bench_runner_throughput);
criterion_main!(benches);
