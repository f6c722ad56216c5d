//! Summary computation benchmarks.
//!
//! Measures how long it takes to turn a run's samples into statistics, and
//! the cost of a complete mock run through the runner.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use protobench_core::{
    BenchmarkRunner, ConnectionProfile, Error, MockDriver, OperationSpec, RunConfig, Sample,
    Summary,
};
use rand::Rng;

fn generate_samples(count: usize) -> Vec<Sample> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let duration = Duration::from_nanos(rng.gen_range(50_000..5_000_000));
            if i % 100 == 99 {
                Sample::failure(duration, &Error::Query("injected".to_string()))
            } else {
                Sample::success(duration)
            }
        })
        .collect()
}

fn bench_summary(c: &mut Criterion) {
    let mut group = c.benchmark_group("summary/from_samples");

    for count in [1_000, 10_000, 100_000] {
        let samples = generate_samples(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &samples, |b, samples| {
            b.iter(|| black_box(Summary::from_samples(samples, Duration::from_secs(1))));
        });
    }

    group.finish();
}

fn bench_mock_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("runner/mock");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let profile = ConnectionProfile::builder("localhost", 3306)
        .user("root")
        .build()
        .unwrap();

    for concurrency in [1, 4] {
        group.bench_with_input(
            BenchmarkId::new("select_1", concurrency),
            &concurrency,
            |b, &concurrency| {
                let runner = BenchmarkRunner::new(
                    Arc::new(MockDriver::new()),
                    RunConfig::parallel(concurrency, 1_000).with_warmup(0),
                );
                b.to_async(&rt).iter(|| async {
                    let result = runner
                        .run(profile.clone(), OperationSpec::scalar("select 1"))
                        .await
                        .unwrap();
                    black_box(result.sample_count())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_summary, bench_mock_run);
criterion_main!(benches);
