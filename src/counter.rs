//! Counter-based synchronization primitives for job completion tracking.
//!
//! A counter is an atomic integer plus a small fixed table of waiter slots.
//! A fiber waiting for the counter to reach a target value claims a slot and
//! parks; whichever thread moves the counter onto that value claims the slot
//! back and hands the fiber to a ready list so it gets resumed.

use crate::error::JobError;
use crate::job_system::JobSystem;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU16, Ordering};

/// Maximum number of fibers that can wait on one counter at the same time.
pub const MAX_WAITERS: usize = 16;

struct WaiterSlot {
    /// Set while the slot is unclaimed.
    free: AtomicBool,
    /// Set once the slot has been matched (or is being filled).
    matched: AtomicBool,
    fiber: AtomicU16,
    target: AtomicI64,
    system: AtomicPtr<JobSystem>,
}

impl WaiterSlot {
    fn new() -> Self {
        WaiterSlot {
            free: AtomicBool::new(true),
            matched: AtomicBool::new(true),
            fiber: AtomicU16::new(0),
            target: AtomicI64::new(0),
            system: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

struct InnerCounter {
    value: AtomicI64,
    waiters: [WaiterSlot; MAX_WAITERS],
}

/// A thread-safe counter for tracking job completion.
///
/// Cloning a counter yields another handle to the same value.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<InnerCounter>,
}

impl Counter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::with_value(0)
    }

    /// Creates a new counter with the specified initial value.
    pub fn with_value(initial: i64) -> Self {
        Counter {
            inner: Arc::new(InnerCounter {
                value: AtomicI64::new(initial),
                waiters: std::array::from_fn(|_| WaiterSlot::new()),
            }),
        }
    }

    /// Adds `by` to the counter and returns the previous value. The value
    /// wraps on overflow.
    pub fn increment(&self, by: i64) -> i64 {
        let prev = self.inner.value.fetch_add(by, Ordering::SeqCst);
        self.check_waiters(prev.wrapping_add(by));
        prev
    }

    /// Subtracts `by` from the counter and returns the previous value.
    ///
    /// Fibers waiting for the resulting value are made ready on the calling
    /// thread.
    pub fn decrement(&self, by: i64) -> i64 {
        let prev = self.inner.value.fetch_sub(by, Ordering::SeqCst);
        self.check_waiters(prev.wrapping_sub(by));
        prev
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> i64 {
        self.inner.value.load(Ordering::SeqCst)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    /// Registers `fiber` of `system` as waiting for the counter to equal
    /// `target`.
    ///
    /// Returns `Ok(true)` if the target was already reached, in which case the
    /// slot is released again and the caller must not park.
    pub(crate) fn register_waiter(
        &self,
        system: &JobSystem,
        fiber: u16,
        target: i64,
    ) -> Result<bool, JobError> {
        for slot in &self.inner.waiters {
            if slot
                .free
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            slot.fiber.store(fiber, Ordering::Relaxed);
            slot.target.store(target, Ordering::Relaxed);
            let system_ptr = system as *const JobSystem as *mut JobSystem;
            slot.system.store(system_ptr, Ordering::Relaxed);
            slot.matched.store(false, Ordering::SeqCst);

            let value = self.inner.value.load(Ordering::SeqCst);
            if slot.matched.load(Ordering::SeqCst) {
                // A concurrent update already claimed us, it will resume us.
                return Ok(false);
            }

            if value == target {
                if slot
                    .matched
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    return Ok(false);
                }
                slot.free.store(true, Ordering::Release);
                return Ok(true);
            }

            return Ok(false);
        }

        Err(JobError::WaiterSlotsFull(MAX_WAITERS))
    }

    fn check_waiters(&self, value: i64) {
        for slot in &self.inner.waiters {
            if slot.free.load(Ordering::Acquire) || slot.matched.load(Ordering::SeqCst) {
                continue;
            }
            if slot.target.load(Ordering::Relaxed) != value {
                continue;
            }
            if slot
                .matched
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let fiber = slot.fiber.load(Ordering::Relaxed);
            let system = slot.system.load(Ordering::Relaxed);
            slot.free.store(true, Ordering::Release);

            // SAFETY: a registered fiber belongs to a running system, and the
            // system outlives every fiber parked in it.
            unsafe { (*system).notify_ready(fiber) };
        }
    }

    /// Number of waiter slots currently claimed.
    pub fn waiting(&self) -> usize {
        self.inner
            .waiters
            .iter()
            .filter(|slot| !slot.free.load(Ordering::Acquire))
            .count()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("value", &self.value())
            .field("waiting", &self.waiting())
            .finish()
    }
}
