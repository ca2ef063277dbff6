//! Job definitions and execution logic.
//!
//! A job is a closure stored inline in a fixed-size buffer together with an
//! optional [`Counter`] that is decremented once the closure has run. Jobs are
//! moved by value into the priority queues, so submitting one never allocates.

use crate::counter::Counter;
use crate::error::JobError;
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::ptr;

/// Number of machine words a job can hold inline.
pub const JOB_CAPACITY_WORDS: usize = 8;

/// Inline closure capacity in bytes.
pub const JOB_CAPACITY: usize = JOB_CAPACITY_WORDS * mem::size_of::<usize>();

/// Strictest closure alignment a job can hold.
pub const JOB_ALIGN: usize = 16;

#[repr(C, align(16))]
struct InlineStorage([MaybeUninit<u8>; JOB_CAPACITY]);

impl InlineStorage {
    const fn uninit() -> Self {
        InlineStorage([MaybeUninit::uninit(); JOB_CAPACITY])
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr().cast()
    }
}

/// Call and drop entry points for the closure type stored in a job.
#[derive(Clone, Copy)]
struct Thunk {
    call: unsafe fn(*mut u8),
    drop: unsafe fn(*mut u8),
}

unsafe fn call_thunk<F: FnOnce()>(data: *mut u8) {
    // SAFETY: caller guarantees `data` holds an initialized `F` that is read once.
    let work = unsafe { ptr::read(data.cast::<F>()) };
    work();
}

unsafe fn drop_thunk<F>(data: *mut u8) {
    // SAFETY: caller guarantees `data` holds an initialized `F` that is dropped once.
    unsafe { ptr::drop_in_place(data.cast::<F>()) };
}

const fn fits<F>() -> bool {
    mem::size_of::<F>() <= JOB_CAPACITY && mem::align_of::<F>() <= JOB_ALIGN
}

/// A unit of work to be executed by the job system.
///
/// Jobs consist of a closure to execute and an optional counter
/// that is decremented upon completion.
pub struct Job {
    storage: InlineStorage,
    thunk: Option<Thunk>,
    counter: Option<Counter>,
}

impl Job {
    /// Creates a new job with the given work function.
    ///
    /// Closures that do not fit in [`JOB_CAPACITY`] bytes are rejected at
    /// compile time. Capture large data behind an `Arc` or `Box` instead.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        const {
            assert!(fits::<F>(), "closure does not fit in the inline job buffer");
        }
        // SAFETY: size and alignment checked above.
        unsafe { Self::store(work, None) }
    }

    /// Creates a new job with an associated counter.
    pub fn with_counter<F>(counter: Counter, work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut job = Job::new(work);
        job.counter = Some(counter);
        job
    }

    /// Like [`Job::new`], but reports an oversized closure as an error instead
    /// of failing to compile.
    pub fn try_new<F>(work: F) -> Result<Self, JobError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !fits::<F>() {
            return Err(JobError::ClosureTooLarge {
                size: mem::size_of::<F>(),
                align: mem::align_of::<F>(),
                capacity: JOB_CAPACITY,
            });
        }
        // SAFETY: size and alignment checked above.
        Ok(unsafe { Self::store(work, None) })
    }

    /// # Safety
    /// `F` must satisfy `fits::<F>()`.
    unsafe fn store<F>(work: F, counter: Option<Counter>) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut storage = InlineStorage::uninit();
        // SAFETY: the buffer is large and aligned enough for `F`.
        unsafe { ptr::write(storage.as_mut_ptr().cast::<F>(), work) };
        Job {
            storage,
            thunk: Some(Thunk {
                call: call_thunk::<F>,
                drop: drop_thunk::<F>,
            }),
            counter,
        }
    }

    /// Attaches (or replaces) the counter decremented when this job completes.
    pub fn set_counter(&mut self, counter: Counter) {
        self.counter = Some(counter);
    }

    pub fn counter(&self) -> Option<&Counter> {
        self.counter.as_ref()
    }

    /// Returns `true` if the job carries no closure.
    pub fn is_empty(&self) -> bool {
        self.thunk.is_none()
    }

    /// Executes the job and decrements its counter if present.
    ///
    /// The counter is decremented even if the closure panics.
    pub fn execute(mut self) {
        let _guard = self.counter.take().map(CounterGuard);
        if let Some(thunk) = self.thunk.take() {
            // SAFETY: `thunk` was taken, so the closure is consumed exactly once
            // here and `Drop` will not touch it again.
            unsafe { (thunk.call)(self.storage.as_mut_ptr()) };
        }
    }
}

impl Default for Job {
    fn default() -> Self {
        Job {
            storage: InlineStorage::uninit(),
            thunk: None,
            counter: None,
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(thunk) = self.thunk.take() {
            // SAFETY: the closure was never executed, drop it in place once.
            unsafe { (thunk.drop)(self.storage.as_mut_ptr()) };
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("empty", &self.is_empty())
            .field("counter", &self.counter)
            .finish()
    }
}

/// Decrements the counter when dropped, so a panicking job still completes.
struct CounterGuard(Counter);

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.decrement(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_job_execution() {
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        let job = Job::new(move || {
            executed_clone.store(true, Ordering::SeqCst);
        });

        job.execute();
        assert!(executed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_job_with_counter() {
        let counter = Counter::with_value(1);
        let job = Job::with_counter(counter.clone(), || {});

        assert_eq!(counter.value(), 1);
        job.execute();
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_empty_job_only_decrements() {
        let counter = Counter::with_value(2);
        let mut job = Job::default();
        assert!(job.is_empty());
        job.set_counter(counter.clone());
        job.execute();
        assert_eq!(counter.value(), 1);
    }

    #[test]
    fn test_unexecuted_job_drops_captures_once() {
        let tracker = Arc::new(());
        let captured = tracker.clone();
        let job = Job::new(move || drop(captured));
        assert_eq!(Arc::strong_count(&tracker), 2);
        drop(job);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_moved_job_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let job = Job::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        let slot = vec![job];
        for job in slot {
            job.execute();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_closure_rejected() {
        let big = [0u64; JOB_CAPACITY_WORDS + 1];
        let err = Job::try_new(move || {
            std::hint::black_box(big);
        })
        .unwrap_err();
        assert!(matches!(
            err,
            JobError::ClosureTooLarge {
                capacity: JOB_CAPACITY,
                ..
            }
        ));

        let fits = [0u8; JOB_CAPACITY];
        assert!(Job::try_new(move || {
            std::hint::black_box(fits);
        })
        .is_ok());
    }

    #[test]
    fn test_counter_decremented_on_panic() {
        let counter = Counter::with_value(1);
        let job = Job::with_counter(counter.clone(), || panic!("job failed"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job.execute()));
        assert!(result.is_err());
        assert_eq!(counter.value(), 0);
    }
}
