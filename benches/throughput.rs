//! Throughput benchmark using criterion.
//!
//! Measures how fast tiny jobs flow through the priority queues when they are
//! scheduled from the main fiber and awaited on one counter.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fiber_jobs::{Counter, JobError, JobPriority, JobSystem, SchedulerConfig, topology};
use std::time::{Duration, Instant};

const JOB_COUNT: usize = 100_000;

fn config(num_threads: usize) -> SchedulerConfig {
    SchedulerConfig {
        num_threads,
        normal_priority_queue_size: 8192,
        ..SchedulerConfig::default()
    }
}

/// Schedules `count` empty jobs, retrying on backpressure, and waits for them.
fn flood(system: &JobSystem, count: usize) {
    let counter = Counter::new();
    for _ in 0..count {
        let mut result = system.schedule_with_counter(JobPriority::Normal, &counter, || {
            std::hint::black_box(1 + 1);
        });
        while let Err(JobError::QueueFull { job, .. }) = result {
            system
                .wait_for_counter(&counter, 0)
                .expect("waiter slots exhausted");
            result = system.schedule_job(JobPriority::Normal, job);
        }
    }
    system
        .wait_for_counter(&counter, 0)
        .expect("waiter slots exhausted");
}

/// Runs `iters` floods inside one scheduler run and times them.
fn timed_run(num_threads: usize, iters: u64) -> Duration {
    let system = JobSystem::new(config(num_threads));
    let mut elapsed = Duration::ZERO;
    system
        .run(|system| {
            let start = Instant::now();
            for _ in 0..iters {
                flood(system, JOB_COUNT);
            }
            elapsed = start.elapsed();
        })
        .expect("job system failed to start");
    elapsed
}

fn bench_throughput(c: &mut Criterion) {
    let num_threads = topology::logical_cores();
    let mut group = c.benchmark_group("throughput");
    group.throughput(Throughput::Elements(JOB_COUNT as u64));
    group.sample_size(10);

    group.bench_function(BenchmarkId::new("jobs_100k", num_threads), |b| {
        b.iter_custom(|iters| timed_run(num_threads, iters))
    });
    group.finish();
}

/// Same workload at different thread counts for scaling analysis.
fn bench_scaling(c: &mut Criterion) {
    let max_threads = topology::logical_cores();
    let mut group = c.benchmark_group("scaling");
    group.throughput(Throughput::Elements(JOB_COUNT as u64));
    group.sample_size(10);

    let mut threads = 1;
    while threads <= max_threads {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &n| {
            b.iter_custom(|iters| timed_run(n, iters))
        });
        threads *= 2;
    }
    group.finish();
}

criterion_group!(benches, bench_throughput, bench_scaling);
criterion_main!(benches);
