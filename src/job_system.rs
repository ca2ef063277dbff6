//! High-level job system interface.
//!
//! The [`JobSystem`] owns the priority queues, the fiber pool and one
//! [`ThreadLocalState`] per worker thread. [`JobSystem::run`] turns the calling
//! thread into worker 0, spawns the remaining workers and runs the main
//! callback on a dedicated fiber; it returns once every worker has exited.

use crate::config::SchedulerConfig;
use crate::counter::Counter;
use crate::error::{JobError, RunError};
use crate::fiber::Fiber;
use crate::fiber_pool::{FiberPool, MAX_FIBERS};
use crate::job::Job;
use crate::queue::{JobPriority, PriorityJobQueue};
use crate::thread_state::{self, FiberDestination, ThreadLocalState};
use crate::topology;
use crate::worker::Worker;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

/// Callback run on the main fiber once the scheduler is live.
pub type MainCallback<'a> = Box<dyn FnOnce(&JobSystem) + Send + 'a>;

/// Lifecycle of a [`JobSystem`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulerState {
    Unstarted = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Unstarted,
            1 => SchedulerState::Running,
            2 => SchedulerState::ShuttingDown,
            _ => SchedulerState::Stopped,
        }
    }
}

/// Hands the main callback to the main fiber through its userdata pointer.
struct MainLaunch<'a> {
    callback: Cell<Option<MainCallback<'a>>>,
}

enum Work {
    Job(Job),
    Resume(u16),
}

/// The fiber job scheduler.
///
/// Jobs can be scheduled from any thread, before or during [`run`]. Waiting on
/// a [`Counter`] is only possible from code running inside the scheduler's
/// fibers: the main callback or a job.
///
/// # Example
///
/// ```no_run
/// use fiber_jobs::{Counter, JobPriority, JobSystem, SchedulerConfig};
///
/// let system = JobSystem::new(SchedulerConfig::with_threads(4));
/// system
///     .run(|system| {
///         let counter = Counter::new();
///         for i in 0..8 {
///             system
///                 .schedule_with_counter(JobPriority::Normal, &counter, move || {
///                     println!("job {i}");
///                 })
///                 .unwrap();
///         }
///         system.wait_for_counter(&counter, 0).unwrap();
///     })
///     .unwrap();
/// ```
///
/// [`run`]: JobSystem::run
pub struct JobSystem {
    config: SchedulerConfig,
    state: AtomicU8,
    queues: PriorityJobQueue,
    thread_states: Box<[ThreadLocalState]>,
    fibers: OnceLock<FiberPool>,
    /// Ready fibers whose counter was matched outside any worker thread.
    remote_ready: ArrayQueue<u16>,
    main_panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl JobSystem {
    /// Creates an unstarted scheduler. Queues are usable right away; threads
    /// and fibers are only created by [`run`](JobSystem::run).
    pub fn new(config: SchedulerConfig) -> Self {
        let num_threads = config.threads();
        let ready_capacity = config.fibers().saturating_add(1);

        JobSystem {
            queues: PriorityJobQueue::new(
                config.high_priority_queue_size.max(1),
                config.normal_priority_queue_size.max(1),
                config.low_priority_queue_size.max(1),
            ),
            thread_states: (0..num_threads)
                .map(|index| ThreadLocalState::new(index, ready_capacity))
                .collect(),
            fibers: OnceLock::new(),
            remote_ready: ArrayQueue::new(ready_capacity),
            main_panic: Mutex::new(None),
            state: AtomicU8::new(SchedulerState::Unstarted as u8),
            config,
        }
    }

    /// Runs the scheduler with `main` as the main callback.
    ///
    /// Blocks until the scheduler has shut down and every worker thread has
    /// been joined. A panic in `main` shuts the scheduler down and is resumed
    /// from here afterwards.
    pub fn run<F>(&self, main: F) -> Result<(), RunError>
    where
        F: FnOnce(&JobSystem) + Send,
    {
        self.run_callback(Some(Box::new(main)))
    }

    /// Like [`run`](JobSystem::run) but with an optional callback, as handed
    /// over by the C API.
    pub fn run_callback(&self, main: Option<MainCallback<'_>>) -> Result<(), RunError> {
        if self.state() != SchedulerState::Unstarted {
            return Err(RunError::AlreadyInitialized);
        }
        let main = main.ok_or(RunError::NullCallback)?;

        let num_fibers = self.config.fibers();
        if num_fibers == 0 || num_fibers > MAX_FIBERS {
            return Err(RunError::InvalidNumFibers(num_fibers));
        }

        let num_threads = self.num_threads();
        let cores = if self.config.thread_affinity {
            let cores = topology::core_ids();
            if num_threads > cores.len() {
                return Err(RunError::ThreadAffinity {
                    threads: num_threads,
                    cores: cores.len(),
                });
            }
            Some(cores)
        } else {
            None
        };

        if self
            .state
            .compare_exchange(
                SchedulerState::Unstarted as u8,
                SchedulerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(RunError::AlreadyInitialized);
        }

        let pool = match FiberPool::new(
            num_fibers,
            self.config.stack_size,
            worker_fiber_entry,
            main_fiber_entry,
        ) {
            Ok(pool) => pool,
            Err(err) => {
                self.set_state(SchedulerState::Stopped);
                return Err(RunError::OsError(err));
            }
        };
        if self.fibers.set(pool).is_err() {
            return Err(RunError::AlreadyInitialized);
        }

        tracing::info!(
            threads = num_threads,
            fibers = num_fibers,
            affinity = self.config.thread_affinity,
            "job system starting"
        );

        let launch = MainLaunch {
            callback: Cell::new(Some(main)),
        };

        let workers_failed = thread::scope(|scope| {
            let mut workers = Vec::with_capacity(num_threads.saturating_sub(1));
            for index in 1..num_threads {
                let core = cores.as_ref().map(|cores| cores[index]);
                match Worker::spawn(scope, index, core, self) {
                    Ok(worker) => workers.push(worker),
                    Err(err) => {
                        tracing::error!(thread = index, error = %err, "failed to spawn worker thread");
                        self.shutdown(false);
                        join_workers(workers);
                        return Err(RunError::OsError(err));
                    }
                }
            }

            self.run_main_thread(&launch);
            Ok(join_workers(workers))
        });

        self.set_state(SchedulerState::Stopped);
        tracing::info!("job system stopped");

        let main_panic = self
            .main_panic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(payload) = main_panic {
            panic::resume_unwind(payload);
        }

        match workers_failed? {
            0 => Ok(()),
            failed => Err(RunError::Unknown(format!(
                "{failed} worker thread(s) panicked"
            ))),
        }
    }

    /// Thread 0: adopt the calling thread and run the main fiber on it.
    fn run_main_thread(&self, launch: &MainLaunch<'_>) {
        let state = self.thread_state(0);
        thread_state::enter(self, 0);
        state.carrier.adopt_current_thread();

        let pool = self.pool();
        let main_index = pool.main_index();
        state.set_current_fiber(main_index);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            state.carrier.switch_to(
                pool.get(main_index),
                launch as *const MainLaunch<'_> as *const (),
            );
            self.cleanup_previous_fiber();
        }));
        thread_state::leave();

        if let Err(payload) = outcome {
            tracing::error!("scheduler panicked on the main thread");
            self.store_main_panic(payload);
            self.shutdown(false);
        }
    }

    /// Body of a spawned worker thread.
    pub(crate) fn worker_thread_main(&self, index: usize) {
        let state = self.thread_state(index);
        thread_state::enter(self, index);
        state.carrier.adopt_current_thread();

        let pool = self.pool();
        if let Some(first) = pool.claim(|| self.may_exit()) {
            state.set_current_fiber(first);
            state.carrier.switch_to(pool.get(first), std::ptr::null());
            self.cleanup_previous_fiber();
        }

        thread_state::leave();
    }

    /// Schedules `job` at `priority`.
    ///
    /// The job's counter, if any, is incremented before the job becomes
    /// visible to workers. On failure the increment is undone and the job is
    /// handed back inside the error.
    pub fn schedule_job(&self, priority: JobPriority, job: Job) -> Result<(), JobError> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown { job });
        }

        if let Some(counter) = job.counter() {
            counter.increment(1);
        }

        self.queues.push(priority, job).map_err(|job| {
            if let Some(counter) = job.counter() {
                counter.decrement(1);
            }
            JobError::QueueFull { priority, job }
        })
    }

    /// Schedules a closure without a counter.
    pub fn schedule<F>(&self, priority: JobPriority, work: F) -> Result<(), JobError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_job(priority, Job::new(work))
    }

    /// Schedules a closure tracked by `counter`.
    pub fn schedule_with_counter<F>(
        &self,
        priority: JobPriority,
        counter: &Counter,
        work: F,
    ) -> Result<(), JobError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_job(priority, Job::with_counter(counter.clone(), work))
    }

    /// Suspends the calling fiber until `counter` equals `target`.
    ///
    /// The worker thread keeps running other jobs meanwhile; the fiber may
    /// resume on a different thread. Shutdown does not abandon a waiting
    /// fiber: workers keep running until every wait has resumed.
    ///
    /// # Panics
    /// If the caller is not running inside one of this scheduler's fibers.
    pub fn wait_for_counter(&self, counter: &Counter, target: i64) -> Result<(), JobError> {
        let state = self.current_thread_state().unwrap_or_else(|| {
            panic!("wait_for_counter must be called from a fiber of this job system")
        });
        if counter.value() == target {
            return Ok(());
        }

        let pool = self.pool();
        let current = state.current_fiber();

        pool.clear_parked(current);
        pool.begin_wait();
        match counter.register_waiter(self, current, target) {
            Ok(false) => {}
            done => {
                pool.end_wait();
                return done.map(drop);
            }
        }

        tracing::trace!(fiber = current, target, "fiber parked");
        state.set_previous(current, FiberDestination::Waiting);

        // This wait keeps `may_exit` false, so the claim never gives up.
        let Some(next) = pool.claim(|| self.may_exit()) else {
            unreachable!("fiber claim abandoned while a wait is pending");
        };
        state.set_current_fiber(next);
        let (from, to) = (pool.get(current), pool.get(next));
        from.switch_to(to, std::ptr::null());

        self.cleanup_previous_fiber();
        pool.end_wait();
        Ok(())
    }

    /// Schedules `job` with a private counter and waits for it to finish.
    ///
    /// Any counter already attached to `job` is replaced.
    pub fn wait_for_single(&self, priority: JobPriority, mut job: Job) -> Result<(), JobError> {
        let counter = Counter::new();
        job.set_counter(counter.clone());
        self.schedule_job(priority, job)?;
        self.wait_for_counter(&counter, 0)
    }

    /// Requests shutdown. Worker loops exit at their next iteration once no
    /// fiber is suspended in a wait; a started job always runs to completion.
    /// Until then workers keep resuming ready fibers and draining the queues,
    /// since a waiting job may depend on work that is still queued.
    ///
    /// With `blocking`, waits until [`run`](JobSystem::run) has joined every
    /// worker. From inside a worker thread the wait is skipped, since it could
    /// never finish.
    pub fn shutdown(&self, blocking: bool) {
        let previous = self
            .state
            .compare_exchange(
                SchedulerState::Running as u8,
                SchedulerState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .or_else(|_| {
                self.state.compare_exchange(
                    SchedulerState::Unstarted as u8,
                    SchedulerState::Stopped as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
            });
        if previous == Ok(SchedulerState::Running as u8) {
            tracing::debug!("job system shutting down");
        }

        if !blocking {
            return;
        }
        if self.current_thread_state().is_some() {
            tracing::warn!("blocking shutdown requested from a worker thread; not waiting");
            return;
        }

        let backoff = Backoff::new();
        while self.state() != SchedulerState::Stopped {
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Worker threads, including the thread that calls `run`.
    pub fn num_threads(&self) -> usize {
        self.thread_states.len()
    }

    /// Pooled fibers, excluding the main fiber.
    pub fn num_fibers(&self) -> usize {
        self.config.fibers()
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() >= SchedulerState::ShuttingDown
    }

    /// Jobs queued at `priority` and not yet picked up by a worker.
    pub fn pending_jobs(&self, priority: JobPriority) -> usize {
        self.queues.len(priority)
    }

    /// Whether worker thread `index` was pinned to a core.
    pub fn is_thread_pinned(&self, index: usize) -> bool {
        self.thread_states
            .get(index)
            .is_some_and(ThreadLocalState::is_pinned)
    }

    /// Index of the worker thread running the caller, if it is one of ours.
    pub fn current_thread_index(&self) -> Option<usize> {
        self.current_thread_state().map(ThreadLocalState::index)
    }

    /// Makes a parked fiber eligible to resume.
    ///
    /// Called by the thread whose counter update matched the fiber's wait.
    pub(crate) fn notify_ready(&self, fiber: u16) {
        let queue = match self.current_thread_state() {
            Some(state) => &state.ready_fibers,
            None => &self.remote_ready,
        };
        // Every fiber sits in at most one ready list and each list can hold
        // all of them.
        queue
            .push(fiber)
            .expect("ready list sized for every fiber overflowed");
    }

    pub(crate) fn thread_state(&self, index: usize) -> &ThreadLocalState {
        &self.thread_states[index]
    }

    fn current_thread_state(&self) -> Option<&ThreadLocalState> {
        let slot = thread_state::current()?;
        if std::ptr::eq(slot.system, self) {
            self.thread_states.get(slot.index)
        } else {
            None
        }
    }

    /// Thread state of the caller, which must be a worker of this system.
    fn worker_state(&self) -> &ThreadLocalState {
        self.current_thread_state()
            .expect("fiber running outside of its job system's worker threads")
    }

    fn pool(&self) -> &FiberPool {
        self.fibers
            .get()
            .expect("fiber pool is created before any fiber runs")
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn store_main_panic(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self
            .main_panic
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(payload);
    }

    /// Finishes a switch: the fiber that ran before on this thread has now
    /// fully suspended and can be released or marked parked.
    fn cleanup_previous_fiber(&self) {
        let state = self.worker_state();
        let (previous, destination) = state.take_previous();
        match destination {
            FiberDestination::Pool => self.pool().release(previous),
            FiberDestination::Waiting => self.pool().mark_parked(previous),
            FiberDestination::None => {}
        }
    }

    /// Whether worker loops may stop: shutdown was requested and no started
    /// job is left suspended.
    fn may_exit(&self) -> bool {
        self.is_shutting_down() && self.pool().waiting() == 0
    }

    /// Loop run by every fiber until shutdown.
    fn worker_loop(&self) {
        let backoff = Backoff::new();
        while !self.may_exit() {
            let state = self.worker_state();
            match self.next_work(state) {
                Some(Work::Job(job)) => {
                    backoff.reset();
                    self.execute_job(job);
                }
                Some(Work::Resume(fiber)) => {
                    backoff.reset();
                    self.resume_fiber(state, fiber);
                }
                None if backoff.is_completed() => {
                    thread::sleep(Duration::from_micros(self.config.idle_sleep_us));
                }
                None => backoff.snooze(),
            }
        }
    }

    fn next_work(&self, state: &ThreadLocalState) -> Option<Work> {
        if let Some(job) = self.queues.pop_priority(JobPriority::High) {
            return Some(Work::Job(job));
        }
        if let Some(fiber) = self.pop_ready(state) {
            return Some(Work::Resume(fiber));
        }
        self.queues
            .pop_priority(JobPriority::Normal)
            .or_else(|| self.queues.pop_priority(JobPriority::Low))
            .map(Work::Job)
    }

    /// Pops a ready fiber whose suspension has completed. Entries still
    /// suspending are pushed back for a later pass.
    fn pop_ready(&self, state: &ThreadLocalState) -> Option<u16> {
        let pool = self.pool();
        for queue in [&state.ready_fibers, &self.remote_ready] {
            for _ in 0..queue.len() {
                let Some(fiber) = queue.pop() else {
                    break;
                };
                if pool.take_parked(fiber) {
                    return Some(fiber);
                }
                queue
                    .push(fiber)
                    .expect("ready list sized for every fiber overflowed");
            }
        }
        None
    }

    fn resume_fiber(&self, state: &ThreadLocalState, fiber: u16) {
        let pool = self.pool();
        let current = state.current_fiber();
        tracing::trace!(fiber, thread = state.index(), "resuming parked fiber");
        state.set_previous(current, FiberDestination::Pool);
        state.set_current_fiber(fiber);
        let (from, to) = (pool.get(current), pool.get(fiber));
        from.switch_to(to, std::ptr::null());
        self.cleanup_previous_fiber();
    }

    fn execute_job(&self, job: Job) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.execute())) {
            tracing::error!(panic = panic_message(&*payload), "job panicked");
        }
    }

    /// Returns from a fiber to the carrier of whichever thread it now runs on.
    fn exit_to_carrier(&self, fiber: &Fiber) -> ! {
        let state = self.worker_state();
        fiber.switch_to(&state.carrier, std::ptr::null());
        unreachable!("fiber resumed after returning to its carrier");
    }

    #[cfg(test)]
    pub(crate) fn take_remote_ready(&self) -> Option<u16> {
        self.remote_ready.pop()
    }
}

impl Default for JobSystem {
    fn default() -> Self {
        JobSystem::new(SchedulerConfig::default())
    }
}

impl fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystem")
            .field("state", &self.state())
            .field("threads", &self.num_threads())
            .field("fibers", &self.num_fibers())
            .finish_non_exhaustive()
    }
}

fn join_workers(workers: Vec<Worker<'_>>) -> usize {
    let mut failed = 0;
    for worker in workers {
        let index = worker.index();
        if worker.join().is_err() {
            tracing::error!(thread = index, "worker thread panicked");
            failed += 1;
        }
    }
    failed
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// The scheduler that owns the fiber starting on this thread.
fn entered_system<'a>() -> &'a JobSystem {
    let slot = thread_state::current()
        .unwrap_or_else(|| panic!("fiber started outside of a worker thread"));
    // SAFETY: `run` joins every worker thread before returning, so the system
    // outlives every fiber that executes.
    unsafe { &*slot.system }
}

fn worker_fiber_entry(fiber: &Fiber) {
    let system = entered_system();
    system.cleanup_previous_fiber();
    system.worker_loop();
    system.exit_to_carrier(fiber);
}

fn main_fiber_entry(fiber: &Fiber) {
    let system = entered_system();
    system.cleanup_previous_fiber();

    // SAFETY: `run_main_thread` passes a `MainLaunch` that lives until `run`
    // returns, and it is read only here, on first entry.
    let launch = unsafe { &*(fiber.userdata() as *const MainLaunch<'_>) };
    if let Some(main) = launch.callback.take() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| main(system))) {
            tracing::error!(
                panic = panic_message(&*payload),
                "main callback panicked; shutting down"
            );
            system.store_main_panic(payload);
            system.shutdown(false);
        }
    }

    if system.config.shutdown_after_main {
        system.shutdown(false);
    }
    system.worker_loop();
    system.exit_to_carrier(fiber);
}
