//! Fiber switch latency benchmark using criterion.
//!
//! Measures the raw round trip carrier -> fiber -> carrier through the public
//! `Fiber` API, without any scheduler involvement.

use criterion::{Criterion, criterion_group, criterion_main};
use fiber_jobs::Fiber;
use std::hint::black_box;

fn ping(fiber: &Fiber) {
    loop {
        fiber.switch_back();
    }
}

fn bench_round_trip(c: &mut Criterion) {
    let carrier = Fiber::carrier();
    carrier.adopt_current_thread();
    let fiber = Fiber::new(128 * 1024).expect("failed to allocate fiber stack");
    fiber.bind(ping);

    c.bench_function("fiber_round_trip", |b| {
        b.iter(|| carrier.switch_to(black_box(&fiber), std::ptr::null()))
    });
}

fn bench_fiber_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fiber_creation");
    for stack_size in [64 * 1024, 512 * 1024] {
        group.bench_function(format!("stack_{}k", stack_size / 1024), |b| {
            b.iter(|| Fiber::new(black_box(stack_size)).expect("failed to allocate fiber stack"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_fiber_creation);
criterion_main!(benches);
