//! Per-thread scheduler state.
//!
//! Each worker thread owns one [`ThreadLocalState`] slot inside the
//! [`JobSystem`]. The OS thread-local below only records which slot the
//! current thread uses; it is read through a non-inlined accessor because a
//! fiber may resume on a different thread than the one it suspended on.

use crate::fiber::Fiber;
use crate::job_system::JobSystem;
use crossbeam::queue::ArrayQueue;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};

/// Where the fiber that just switched away should go.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberDestination {
    None = 0,
    /// Back to the pool of idle fibers.
    Pool = 1,
    /// Parked until a counter resumes it.
    Waiting = 2,
}

impl FiberDestination {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FiberDestination::Pool,
            2 => FiberDestination::Waiting,
            _ => FiberDestination::None,
        }
    }
}

pub(crate) struct ThreadLocalState {
    index: usize,
    pinned: AtomicBool,
    /// Native context of the thread.
    pub(crate) carrier: Fiber,
    current_fiber: AtomicU16,
    previous_fiber: AtomicU16,
    previous_destination: AtomicU8,
    /// Fibers made ready by counter updates performed on this thread.
    pub(crate) ready_fibers: ArrayQueue<u16>,
}

impl ThreadLocalState {
    pub(crate) fn new(index: usize, ready_capacity: usize) -> Self {
        ThreadLocalState {
            index,
            pinned: AtomicBool::new(false),
            carrier: Fiber::carrier(),
            current_fiber: AtomicU16::new(0),
            previous_fiber: AtomicU16::new(0),
            previous_destination: AtomicU8::new(FiberDestination::None as u8),
            ready_fibers: ArrayQueue::new(ready_capacity.max(1)),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Relaxed);
    }

    pub(crate) fn current_fiber(&self) -> u16 {
        self.current_fiber.load(Ordering::Relaxed)
    }

    pub(crate) fn set_current_fiber(&self, index: u16) {
        self.current_fiber.store(index, Ordering::Relaxed);
    }

    /// Records the fiber about to be switched away from.
    pub(crate) fn set_previous(&self, index: u16, destination: FiberDestination) {
        self.previous_fiber.store(index, Ordering::Relaxed);
        self.previous_destination
            .store(destination as u8, Ordering::Relaxed);
    }

    /// Takes the pending previous-fiber record, leaving `None` behind.
    pub(crate) fn take_previous(&self) -> (u16, FiberDestination) {
        let destination = self
            .previous_destination
            .swap(FiberDestination::None as u8, Ordering::Relaxed);
        (
            self.previous_fiber.load(Ordering::Relaxed),
            FiberDestination::from_u8(destination),
        )
    }
}

/// Identifies the scheduler slot bound to the current OS thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSlot {
    pub(crate) system: *const JobSystem,
    pub(crate) index: usize,
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerSlot>> = const { Cell::new(None) };
}

#[inline(never)]
pub(crate) fn current() -> Option<WorkerSlot> {
    CURRENT_WORKER.with(|slot| slot.get())
}

/// Binds the calling thread to slot `index` of `system`.
pub(crate) fn enter(system: &JobSystem, index: usize) {
    CURRENT_WORKER.with(|slot| {
        slot.set(Some(WorkerSlot {
            system: system as *const JobSystem,
            index,
        }))
    });
}

#[inline(never)]
pub(crate) fn leave() {
    CURRENT_WORKER.with(|slot| slot.set(None));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_record_taken_once() {
        let state = ThreadLocalState::new(0, 4);
        assert_eq!(state.take_previous().1, FiberDestination::None);

        state.set_previous(3, FiberDestination::Waiting);
        assert_eq!(state.take_previous(), (3, FiberDestination::Waiting));
        assert_eq!(state.take_previous().1, FiberDestination::None);
    }

    #[test]
    fn test_thread_not_bound_by_default() {
        std::thread::spawn(|| assert!(current().is_none()))
            .join()
            .unwrap();
    }
}
