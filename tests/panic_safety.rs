use fiber_jobs::{Counter, JobPriority, JobSystem, SchedulerConfig, SchedulerState};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        num_threads: 1,
        num_fibers: Some(4),
        stack_size: 128 * 1024,
        idle_sleep_us: 50,
        ..SchedulerConfig::default()
    }
}

#[test]
fn test_panic_safety_counter_decrement() {
    let system = JobSystem::new(config());

    system
        .run(|system| {
            let counter = Counter::new();
            system
                .schedule_with_counter(JobPriority::Normal, &counter, || {
                    panic!("Intentional panic for testing");
                })
                .unwrap();
            system.wait_for_counter(&counter, 0).unwrap();
            assert!(
                counter.is_complete(),
                "Counter should be zero even after panic"
            );
        })
        .unwrap();
}

#[test]
fn test_worker_recovery_after_panic() {
    let system = JobSystem::new(config());
    let success = Arc::new(AtomicBool::new(false));

    let success_clone = success.clone();
    system
        .run(move |system| {
            let counter = Counter::new();
            system
                .schedule_with_counter(JobPriority::High, &counter, || panic!("Boom"))
                .unwrap();
            system
                .schedule_with_counter(JobPriority::Low, &counter, move || {
                    success_clone.store(true, Ordering::SeqCst);
                })
                .unwrap();
            system.wait_for_counter(&counter, 0).unwrap();
        })
        .unwrap();

    assert!(
        success.load(Ordering::SeqCst),
        "Subsequent job failed to run"
    );
}

#[test]
fn test_main_callback_panic_propagates() {
    let system = JobSystem::new(SchedulerConfig {
        shutdown_after_main: false,
        ..config()
    });

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = system.run(|_| panic!("main failed"));
    }));

    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"main failed"));
    assert_eq!(system.state(), SchedulerState::Stopped);
}
