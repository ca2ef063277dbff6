//! # fiber-jobs - Fiber-Based Job Scheduler
//!
//! A job system in the style of the fiber schedulers used by game engines: a
//! fixed set of worker threads runs a fixed pool of fibers, and jobs are pulled
//! from three priority queues. A job (or the main callback) can wait on a
//! [`Counter`]; waiting suspends only the fiber, and the worker thread moves
//! on to other jobs.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful coroutines with symmetric `switch_to`, one pool
//!   shared by all threads
//! - **Priority queues**: bounded High/Normal/Low rings, High always first
//! - **Counters**: atomic values with a few waiter slots; reaching a waiter's
//!   target makes its fiber ready again
//! - **Worker threads**: OS threads, optionally pinned to cores; the thread
//!   calling [`JobSystem::run`] is worker 0
//!
//! ## Example
//!
//! ```no_run
//! use fiber_jobs::{Counter, JobPriority, JobSystem, SchedulerConfig};
//!
//! let system = JobSystem::new(SchedulerConfig::with_threads(4));
//!
//! system
//!     .run(|system| {
//!         let counter = Counter::new();
//!         system
//!             .schedule_with_counter(JobPriority::High, &counter, || {
//!                 println!("Hello from a fiber job!");
//!             })
//!             .unwrap();
//!         system.wait_for_counter(&counter, 0).unwrap();
//!     })
//!     .unwrap();
//! ```

pub mod c_api;
pub mod config;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod fiber_pool;
pub mod group;
pub mod job;
pub mod job_system;
pub mod queue;
mod thread_state;
pub mod topology;
mod worker;

pub use config::SchedulerConfig;
pub use counter::Counter;
pub use error::{ConfigError, JobError, ReturnCode, RunError};
pub use fiber::Fiber;
pub use group::{JobGroup, JobPipeline};
pub use job::Job;
pub use job_system::{JobSystem, MainCallback, SchedulerState};
pub use queue::JobPriority;
