//! Bounded priority job queues.

use crate::job::Job;
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};

/// Priority level of a scheduled job.
///
/// Workers always drain `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Serialize, Deserialize)]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    pub const ALL: [JobPriority; 3] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];
}

/// Three fixed-capacity multi-producer/multi-consumer job rings, one per
/// priority level. Capacity never changes after construction.
pub struct PriorityJobQueue {
    high: ArrayQueue<Job>,
    normal: ArrayQueue<Job>,
    low: ArrayQueue<Job>,
}

impl PriorityJobQueue {
    /// # Panics
    /// If any capacity is zero.
    pub fn new(high: usize, normal: usize, low: usize) -> Self {
        PriorityJobQueue {
            high: ArrayQueue::new(high),
            normal: ArrayQueue::new(normal),
            low: ArrayQueue::new(low),
        }
    }

    fn queue(&self, priority: JobPriority) -> &ArrayQueue<Job> {
        match priority {
            JobPriority::High => &self.high,
            JobPriority::Normal => &self.normal,
            JobPriority::Low => &self.low,
        }
    }

    /// Pushes a job, handing it back if the ring for `priority` is full.
    pub fn push(&self, priority: JobPriority, job: Job) -> Result<(), Job> {
        self.queue(priority).push(job)
    }

    pub fn pop_priority(&self, priority: JobPriority) -> Option<Job> {
        self.queue(priority).pop()
    }

    /// Pops the next job in priority order.
    pub fn pop(&self) -> Option<Job> {
        self.high
            .pop()
            .or_else(|| self.normal.pop())
            .or_else(|| self.low.pop())
    }

    pub fn len(&self, priority: JobPriority) -> usize {
        self.queue(priority).len()
    }

    pub fn capacity(&self, priority: JobPriority) -> usize {
        self.queue(priority).capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}
