//! Worker thread implementation.
//!
//! Every worker thread adopts its native context as a carrier fiber, claims a
//! pooled fiber and switches into it. From then on the thread only runs
//! fibers; it returns to the carrier once the scheduler shuts down.

use crate::job_system::JobSystem;
use core_affinity::CoreId;
use std::io;
use std::thread::{self, Scope, ScopedJoinHandle};

/// A spawned worker thread. Thread 0 is the caller of `run` and has no
/// `Worker`.
pub struct Worker<'scope> {
    index: usize,
    handle: ScopedJoinHandle<'scope, ()>,
}

impl<'scope> Worker<'scope> {
    /// Starts worker thread `index`, pinned to `core` when given.
    pub(crate) fn spawn<'env>(
        scope: &'scope Scope<'scope, 'env>,
        index: usize,
        core: Option<CoreId>,
        system: &'env JobSystem,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("fiber-worker-{index}"))
            .spawn_scoped(scope, move || {
                if let Some(core) = core {
                    let pinned = core_affinity::set_for_current(core);
                    if !pinned {
                        tracing::warn!(
                            thread = index,
                            core = core.id,
                            "failed to pin worker thread"
                        );
                    }
                    system.thread_state(index).set_pinned(pinned);
                }

                tracing::debug!(thread = index, "worker thread started");
                system.worker_thread_main(index);
                tracing::debug!(thread = index, "worker thread exited");
            })?;

        Ok(Worker { index, handle })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Waits for the worker thread to finish.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}
