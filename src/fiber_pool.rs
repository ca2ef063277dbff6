use crate::fiber::{Fiber, FiberEntry};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Upper bound on pooled fibers; indices must fit a `u16` with room for the
/// main fiber.
pub const MAX_FIBERS: usize = u16::MAX as usize - 1;

/// A fixed set of fibers shared by every worker thread.
///
/// Indices `0..num_fibers` are pooled fibers handed out by [`claim`]. Index
/// `num_fibers` is the main fiber, which runs the user's main callback and is
/// never claimed.
///
/// [`claim`]: FiberPool::claim
pub struct FiberPool {
    fibers: Box<[Fiber]>,
    /// `true` while a pooled fiber is free to claim.
    idle: Box<[AtomicBool]>,
    /// `true` while a fiber is suspended in a wait and safe to resume.
    parked: Box<[AtomicBool]>,
    /// Fibers between registering a wait and resuming from it.
    waiting: AtomicUsize,
}

impl FiberPool {
    /// Allocates `num_fibers` pooled fibers bound to `entry` plus the main
    /// fiber bound to `main_entry`.
    pub fn new(
        num_fibers: usize,
        stack_size: usize,
        entry: FiberEntry,
        main_entry: FiberEntry,
    ) -> std::io::Result<Self> {
        let total = num_fibers + 1;
        let mut fibers = Vec::with_capacity(total);
        for index in 0..total {
            let fiber = Fiber::new(stack_size)?;
            fiber.bind(if index == num_fibers { main_entry } else { entry });
            fibers.push(fiber);
        }

        Ok(FiberPool {
            fibers: fibers.into_boxed_slice(),
            idle: (0..num_fibers)
                .map(|_| AtomicBool::new(true))
                .collect(),
            parked: (0..total).map(|_| AtomicBool::new(false)).collect(),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Number of pooled fibers, excluding the main fiber.
    pub fn len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }

    pub fn main_index(&self) -> u16 {
        self.len() as u16
    }

    pub fn get(&self, index: u16) -> &Fiber {
        &self.fibers[index as usize]
    }

    /// Claims an idle pooled fiber, spinning until one frees up.
    ///
    /// Returns `None` as soon as `give_up` reports `true` while every fiber is
    /// busy.
    pub fn claim(&self, give_up: impl Fn() -> bool) -> Option<u16> {
        let backoff = Backoff::new();
        let mut warned = false;
        loop {
            if let Some(index) = self.try_claim() {
                return Some(index);
            }
            if give_up() {
                return None;
            }

            if backoff.is_completed() && !warned {
                tracing::warn!(
                    fibers = self.len(),
                    "all fibers are busy; waiting for one to be released"
                );
                warned = true;
            }
            backoff.snooze();
        }
    }

    /// Claims an idle pooled fiber without waiting.
    pub fn try_claim(&self) -> Option<u16> {
        self.idle
            .iter()
            .position(|flag| {
                flag.compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            })
            .map(|index| index as u16)
    }

    /// Returns a pooled fiber. Must only be called once the fiber has been
    /// switched away from.
    pub fn release(&self, index: u16) {
        if let Some(flag) = self.idle.get(index as usize) {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn is_idle(&self, index: u16) -> bool {
        self.idle
            .get(index as usize)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Records that a waiting fiber has fully suspended.
    pub fn mark_parked(&self, index: u16) {
        self.parked[index as usize].store(true, Ordering::Release);
    }

    /// Clears the parked flag before a fiber registers a new wait.
    pub fn clear_parked(&self, index: u16) {
        self.parked[index as usize].store(false, Ordering::Release);
    }

    /// Takes the right to resume a parked fiber. Fails while the fiber is
    /// still in the middle of suspending.
    pub fn take_parked(&self, index: u16) -> bool {
        self.parked[index as usize]
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Counts a fiber entering a wait. Must be paired with [`end_wait`].
    ///
    /// [`end_wait`]: FiberPool::end_wait
    pub fn begin_wait(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_wait(&self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    /// Fibers currently suspended in a wait or about to be.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        // A fiber still parked in a wait sits inside a job; unwinding its stack
        // would run the job's panic handler. Leak those stacks instead.
        for (fiber, parked) in self.fibers.iter().zip(self.parked.iter()) {
            if parked.load(Ordering::Acquire) {
                fiber.abandon();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_entry(_fiber: &Fiber) {
        unreachable!("pool tests never start fibers");
    }

    fn pool(num_fibers: usize) -> FiberPool {
        FiberPool::new(num_fibers, 64 * 1024, noop_entry, noop_entry).unwrap()
    }

    #[test]
    fn test_pool_layout() {
        let pool = pool(4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.main_index(), 4);
        assert!(!pool.get(4).is_started());
        assert!(!pool.is_idle(4));
    }

    #[test]
    fn test_claim_and_release() {
        let pool = pool(2);
        let a = pool.claim(|| false).unwrap();
        let b = pool.claim(|| false).unwrap();
        assert_ne!(a, b);
        assert!(!pool.is_idle(a));
        assert_eq!(pool.try_claim(), None);

        pool.release(a);
        assert!(pool.is_idle(a));
        assert_eq!(pool.try_claim(), Some(a));
    }

    #[test]
    fn test_claim_gives_up_when_exhausted() {
        let pool = pool(1);
        assert_eq!(pool.claim(|| true), Some(0));
        assert_eq!(pool.claim(|| true), None);
    }

    #[test]
    fn test_release_ignores_main_fiber() {
        let pool = pool(1);
        pool.release(pool.main_index());
        assert!(!pool.is_idle(pool.main_index()));
        assert_eq!(pool.try_claim(), Some(0));
        assert_eq!(pool.try_claim(), None);
    }

    #[test]
    fn test_parked_flag_taken_once() {
        let pool = pool(2);
        assert!(!pool.take_parked(1));
        pool.mark_parked(1);
        assert!(pool.take_parked(1));
        assert!(!pool.take_parked(1));

        pool.mark_parked(0);
        pool.clear_parked(0);
        assert!(!pool.take_parked(0));
    }

    #[test]
    fn test_waiting_count() {
        let pool = pool(2);
        assert_eq!(pool.waiting(), 0);
        pool.begin_wait();
        pool.begin_wait();
        pool.end_wait();
        assert_eq!(pool.waiting(), 1);
    }
}
