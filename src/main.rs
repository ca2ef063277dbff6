use fiber_jobs::{
    Counter, Job, JobError, JobGroup, JobPipeline, JobPriority, JobSystem, SchedulerConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match SchedulerConfig::from_path(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(path = %path, error = %err, "failed to load config");
                std::process::exit(1);
            }
        },
        None => SchedulerConfig::default(),
    };

    println!("fiber-jobs - Fiber-Based Job Scheduler\n");
    let system = JobSystem::new(config);
    println!(
        "Starting with {} threads and {} fibers\n",
        system.num_threads(),
        system.num_fibers()
    );

    if let Err(err) = system.run(demo) {
        tracing::error!(error = %err, code = ?err.code(), "job system failed to run");
        std::process::exit(1);
    }
    println!("Done!");
}

fn demo(system: &JobSystem) {
    // Example 1: Single job
    println!("Example 1: wait for a single job");
    let job = Job::new(|| println!("  Hello from a fiber job!"));
    if let Err(err) = system.wait_for_single(JobPriority::Normal, job) {
        tracing::error!(error = %err, "single job failed");
    }
    println!();

    // Example 2: Parallel sum
    println!("Example 2: parallel computation");
    let sum = Arc::new(AtomicUsize::new(0));
    let num_jobs = 100;
    let start = Instant::now();
    let mut group = JobGroup::new(system, JobPriority::Normal);
    for i in 0..num_jobs {
        let sum = sum.clone();
        let scheduled = group.spawn(move || {
            let mut local = 0usize;
            for j in 0..1000 {
                local = local.wrapping_add(j);
            }
            std::hint::black_box(local);
            sum.fetch_add(i, Ordering::SeqCst);
        });
        if let Err(err) = scheduled {
            tracing::warn!(error = %err, "job rejected");
        }
    }
    if let Err(err) = group.wait(0) {
        tracing::error!(error = %err, "group wait failed");
    }
    let expected: usize = (0..num_jobs).sum();
    println!("  Executed {} jobs in {:?}", num_jobs, start.elapsed());
    println!(
        "  Sum result: {} (expected: {})\n",
        sum.load(Ordering::SeqCst),
        expected
    );

    // Example 3: Pipeline
    println!("Example 3: sequential pipeline");
    let mut pipeline = JobPipeline::new(system, JobPriority::High);
    for stage in 0..3 {
        pipeline.spawn(move || println!("  stage {stage}"));
    }
    if let Err(err) = pipeline.execute() {
        tracing::error!(error = %err, "pipeline failed");
    }
    println!();

    // Example 4: Throughput
    println!("Example 4: throughput");
    let num_jobs = 10_000;
    let counter = Counter::new();
    let start = Instant::now();
    let mut scheduled = 0;
    for _ in 0..num_jobs {
        let job = Job::with_counter(counter.clone(), || {
            std::hint::black_box((0..10).sum::<u32>());
        });
        let mut pending = Some(job);
        while let Some(job) = pending.take() {
            match system.schedule_job(JobPriority::Low, job) {
                Ok(()) => scheduled += 1,
                // Queue full: let the workers drain it, then retry.
                Err(JobError::QueueFull { job, .. }) => {
                    if let Err(err) = system.wait_for_counter(&counter, 0) {
                        tracing::error!(error = %err, "throughput wait failed");
                        return;
                    }
                    pending = Some(job);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "job rejected");
                    break;
                }
            }
        }
    }
    if let Err(err) = system.wait_for_counter(&counter, 0) {
        tracing::error!(error = %err, "throughput wait failed");
    }
    let elapsed = start.elapsed();
    println!("  Executed {} jobs in {:?}", scheduled, elapsed);
    println!(
        "  Throughput: {:.2} jobs/second\n",
        scheduled as f64 / elapsed.as_secs_f64()
    );

    println!("Shutting down job system...");
}
