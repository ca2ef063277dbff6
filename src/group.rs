//! Job groups sharing one counter, and sequential job pipelines.

use crate::counter::Counter;
use crate::error::JobError;
use crate::job::Job;
use crate::job_system::JobSystem;
use crate::queue::JobPriority;
use std::collections::VecDeque;

/// A set of jobs tracked by one shared counter.
///
/// Jobs added to a group may run in parallel with each other.
pub struct JobGroup<'a> {
    system: &'a JobSystem,
    counter: Counter,
    default_priority: JobPriority,
}

impl<'a> JobGroup<'a> {
    pub fn new(system: &'a JobSystem, default_priority: JobPriority) -> Self {
        JobGroup {
            system,
            counter: Counter::new(),
            default_priority,
        }
    }

    /// Schedules `job` at `priority`, tracked by the group's counter.
    pub fn add(&mut self, priority: JobPriority, mut job: Job) -> Result<(), JobError> {
        job.set_counter(self.counter.clone());
        self.system.schedule_job(priority, job)
    }

    /// Schedules `job` at the group's default priority.
    pub fn push(&mut self, job: Job) -> Result<(), JobError> {
        self.add(self.default_priority, job)
    }

    /// Schedules a closure at the group's default priority.
    pub fn spawn<F>(&mut self, work: F) -> Result<(), JobError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Job::new(work))
    }

    /// Waits until the group's counter equals `target`; `0` waits for every
    /// job added so far.
    pub fn wait(&self, target: i64) -> Result<(), JobError> {
        self.system.wait_for_counter(&self.counter, target)
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }
}

/// An ordered list of jobs executed one after another.
///
/// Each [`step`](JobPipeline::step) schedules the front job and waits for it
/// before the next one is started.
pub struct JobPipeline<'a> {
    system: &'a JobSystem,
    counter: Counter,
    default_priority: JobPriority,
    jobs: VecDeque<(JobPriority, Job)>,
}

impl<'a> JobPipeline<'a> {
    pub fn new(system: &'a JobSystem, default_priority: JobPriority) -> Self {
        JobPipeline {
            system,
            counter: Counter::new(),
            default_priority,
            jobs: VecDeque::new(),
        }
    }

    /// Appends `job` to run at `priority`.
    pub fn add(&mut self, priority: JobPriority, mut job: Job) {
        job.set_counter(self.counter.clone());
        self.jobs.push_back((priority, job));
    }

    /// Appends `job` at the pipeline's default priority.
    pub fn push(&mut self, job: Job) {
        self.add(self.default_priority, job);
    }

    pub fn spawn<F>(&mut self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Job::new(work));
    }

    /// Runs the front job to completion.
    ///
    /// Returns `Ok(false)` once the pipeline is empty. A job the scheduler
    /// rejects is removed from the pipeline and handed back in the error.
    pub fn step(&mut self) -> Result<bool, JobError> {
        let Some((priority, job)) = self.jobs.pop_front() else {
            return Ok(false);
        };

        self.system.schedule_job(priority, job)?;
        self.system.wait_for_counter(&self.counter, 0)?;
        Ok(true)
    }

    /// Runs every remaining job in order.
    pub fn execute(&mut self) -> Result<(), JobError> {
        while self.step()? {}
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
