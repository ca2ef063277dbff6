//! Fiber management and execution context.
//!
//! A [`Fiber`] is a stackful execution context built on a `corosensei`
//! coroutine. Coroutines only support asymmetric resume/suspend, so symmetric
//! transfer is layered on top: every OS thread adopts itself as a *carrier*
//! fiber, and a carrier's `switch_to` runs a trampoline that keeps resuming
//! whichever fiber the running one transfers to, until some fiber switches
//! back to the carrier.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, UnsafeCell};
use std::thread::{self, ThreadId};

/// Entry point of a fiber. Entry points never return; they end by switching
/// to another fiber.
pub type FiberEntry = fn(&Fiber);

// Wrapper for a raw fiber pointer so it can cross the coroutine boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiberHandle(pub *const Fiber);

unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

impl FiberHandle {
    fn of(fiber: &Fiber) -> Self {
        FiberHandle(fiber as *const Fiber)
    }
}

/// What a suspended fiber asks its carrier to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberSwitch {
    /// Resume this fiber.
    To(FiberHandle),
    /// Return control to the carrier itself.
    Carrier,
}

type FiberCoroutine = Coroutine<FiberHandle, FiberSwitch, (), DefaultStack>;

/// A stackful execution context.
///
/// A fiber is either pooled (owns a stack and a coroutine) or a carrier (the
/// native context of an OS thread).
pub struct Fiber {
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
    /// Valid only while the fiber is running.
    yielder: Cell<*const Yielder<FiberHandle, FiberSwitch>>,
    entry: Cell<Option<FiberEntry>>,
    userdata: Cell<*const ()>,
    return_fiber: Cell<*const Fiber>,
    /// Thread that adopted this carrier. Always `None` for pooled fibers.
    owner: Cell<Option<ThreadId>>,
}

// SAFETY: a fiber is only ever touched by the one thread that is currently
// running it (or about to resume it). The scheduler enforces this with the
// idle/parked flags of the fiber pool.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates an unbound fiber with its own stack of `stack_size` bytes.
    pub fn new(stack_size: usize) -> std::io::Result<Self> {
        let stack = DefaultStack::new(stack_size)?;
        let coroutine = Coroutine::with_stack(stack, |yielder, handle: FiberHandle| {
            // SAFETY: the carrier resumes a fiber with its own handle, and the
            // fiber does not move while its coroutine exists.
            let fiber = unsafe { &*handle.0 };
            fiber.yielder.set(yielder as *const _);
            let entry = fiber
                .entry
                .get()
                .unwrap_or_else(|| panic!("fiber started without an entry point"));
            entry(fiber);
        });

        Ok(Fiber {
            coroutine: UnsafeCell::new(Some(coroutine)),
            yielder: Cell::new(std::ptr::null()),
            entry: Cell::new(None),
            userdata: Cell::new(std::ptr::null()),
            return_fiber: Cell::new(std::ptr::null()),
            owner: Cell::new(None),
        })
    }

    /// Creates a carrier fiber. It becomes usable once a thread adopts it.
    pub fn carrier() -> Self {
        Fiber {
            coroutine: UnsafeCell::new(None),
            yielder: Cell::new(std::ptr::null()),
            entry: Cell::new(None),
            userdata: Cell::new(std::ptr::null()),
            return_fiber: Cell::new(std::ptr::null()),
            owner: Cell::new(None),
        }
    }

    /// Turns the calling thread's native context into this carrier.
    pub fn adopt_current_thread(&self) {
        assert!(self.is_carrier(), "only carrier fibers can adopt a thread");
        self.owner.set(Some(thread::current().id()));
    }

    /// Sets the callback run when the fiber first starts.
    ///
    /// # Panics
    /// If the fiber is a carrier or has already started.
    pub fn bind(&self, entry: FiberEntry) {
        assert!(!self.is_carrier(), "carrier fibers have no entry point");
        assert!(
            !self.is_started(),
            "fiber entry point cannot be rebound after the fiber has started"
        );
        self.entry.set(Some(entry));
    }

    pub fn is_carrier(&self) -> bool {
        // SAFETY: only the presence of the coroutine is inspected.
        unsafe { (*self.coroutine.get()).is_none() }
    }

    pub fn is_started(&self) -> bool {
        // SAFETY: see `is_carrier`.
        unsafe {
            (*self.coroutine.get())
                .as_ref()
                .is_some_and(|coroutine| coroutine.started())
        }
    }

    /// Opaque pointer passed by the last `switch_to` into this fiber.
    pub fn userdata(&self) -> *const () {
        self.userdata.get()
    }

    /// Suspends this fiber and transfers control to `other`.
    ///
    /// `userdata` is stored on `other` and this fiber becomes `other`'s return
    /// path. Returns when some fiber switches back into this one, possibly on
    /// another OS thread.
    pub fn switch_to(&self, other: &Fiber, userdata: *const ()) {
        assert!(
            !std::ptr::eq(self, other),
            "a fiber cannot switch to itself"
        );
        other.userdata.set(userdata);
        other.return_fiber.set(self as *const Fiber);
        self.transfer(other);
    }

    /// Transfers control back to the fiber that last switched into this one.
    ///
    /// # Panics
    /// If no return path is recorded.
    pub fn switch_back(&self) {
        let target = self.return_fiber.get();
        assert!(
            !target.is_null(),
            "unable to switch back: no return fiber recorded"
        );
        // SAFETY: the return fiber is owned by the same pool or thread state
        // as this one and outlives it.
        self.transfer(unsafe { &*target });
    }

    fn transfer(&self, other: &Fiber) {
        if self.is_carrier() {
            assert!(
                !other.is_carrier(),
                "a carrier cannot switch to another carrier"
            );
            self.run_carrier(other);
            return;
        }

        let yielder = self.yielder.get();
        assert!(
            !yielder.is_null(),
            "switch from a fiber that is not running"
        );

        let request = if other.is_carrier() {
            assert_eq!(
                other.owner.get(),
                Some(thread::current().id()),
                "cannot switch to a carrier owned by another thread"
            );
            FiberSwitch::Carrier
        } else {
            FiberSwitch::To(FiberHandle::of(other))
        };

        // SAFETY: the yielder belongs to the coroutine currently running on
        // this thread, which is this fiber.
        unsafe { (*yielder).suspend(request) };
    }

    /// Trampoline: resumes fibers until one of them returns to the carrier.
    fn run_carrier(&self, first: &Fiber) {
        debug_assert_eq!(self.owner.get(), Some(thread::current().id()));

        let mut next = FiberHandle::of(first);
        loop {
            // SAFETY: fibers handed to a carrier are alive and claimed by this
            // thread until they suspend again.
            let fiber = unsafe { &*next.0 };
            match fiber.resume() {
                FiberSwitch::To(handle) => next = handle,
                FiberSwitch::Carrier => return,
            }
        }
    }

    fn resume(&self) -> FiberSwitch {
        // SAFETY: only the carrier that currently owns this fiber resumes it.
        let coroutine = unsafe { &mut *self.coroutine.get() };
        let coroutine = match coroutine.as_mut() {
            Some(coroutine) => coroutine,
            None => panic!("cannot resume a carrier fiber"),
        };
        match coroutine.resume(FiberHandle::of(self)) {
            CoroutineResult::Yield(request) => request,
            CoroutineResult::Return(()) => {
                panic!("fiber entry point returned without switching away")
            }
        }
    }

    /// Leaks the coroutine (and its stack) instead of unwinding it on drop.
    ///
    /// Used for fibers parked inside a job when the scheduler goes away.
    pub(crate) fn abandon(&self) {
        // SAFETY: called only once no thread runs this fiber anymore.
        if let Some(coroutine) = unsafe { (*self.coroutine.get()).take() } {
            std::mem::forget(coroutine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const STACK: usize = 64 * 1024;

    struct Script {
        log: Mutex<Vec<&'static str>>,
        carrier: *const Fiber,
        other: *const Fiber,
    }

    fn script(fiber: &Fiber) -> &Script {
        unsafe { &*(fiber.userdata() as *const Script) }
    }

    fn entry_a(fiber: &Fiber) {
        let data = script(fiber);
        data.log.lock().unwrap().push("a:start");
        fiber.switch_to(unsafe { &*data.other }, fiber.userdata());
        data.log.lock().unwrap().push("a:resumed");
        fiber.switch_to(unsafe { &*data.carrier }, std::ptr::null());
        unreachable!();
    }

    fn entry_b(fiber: &Fiber) {
        script(fiber).log.lock().unwrap().push("b:start");
        fiber.switch_back();
        unreachable!();
    }

    #[test]
    fn test_switch_to_and_back() {
        let carrier = Fiber::carrier();
        carrier.adopt_current_thread();
        let a = Fiber::new(STACK).unwrap();
        let b = Fiber::new(STACK).unwrap();
        a.bind(entry_a);
        b.bind(entry_b);

        let data = Script {
            log: Mutex::new(Vec::new()),
            carrier: &carrier,
            other: &b,
        };
        carrier.switch_to(&a, &data as *const Script as *const ());

        assert_eq!(
            *data.log.lock().unwrap(),
            vec!["a:start", "b:start", "a:resumed"]
        );
        assert!(a.is_started());
        assert!(b.is_started());
    }

    fn entry_return_to_carrier(fiber: &Fiber) {
        fiber.switch_back();
        unreachable!();
    }

    #[test]
    fn test_switch_back_to_carrier() {
        let carrier = Fiber::carrier();
        carrier.adopt_current_thread();
        let fiber = Fiber::new(STACK).unwrap();
        fiber.bind(entry_return_to_carrier);
        carrier.switch_to(&fiber, std::ptr::null());
        assert!(fiber.is_started());
    }

    #[test]
    #[should_panic(expected = "no return fiber")]
    fn test_switch_back_without_return_path() {
        let carrier = Fiber::carrier();
        carrier.adopt_current_thread();
        carrier.switch_back();
    }

    #[test]
    fn test_rebind_after_start_rejected() {
        let carrier = Fiber::carrier();
        carrier.adopt_current_thread();
        let fiber = Fiber::new(STACK).unwrap();
        fiber.bind(entry_return_to_carrier);
        carrier.switch_to(&fiber, std::ptr::null());

        let rebind = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            fiber.bind(entry_return_to_carrier)
        }));
        assert!(rebind.is_err());
    }

    #[test]
    #[should_panic(expected = "carrier cannot switch to another carrier")]
    fn test_carrier_to_carrier_rejected() {
        let carrier = Fiber::carrier();
        carrier.adopt_current_thread();
        let other = Fiber::carrier();
        carrier.switch_to(&other, std::ptr::null());
    }
}
