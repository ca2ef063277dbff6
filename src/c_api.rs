//! C API for embedding the job system.
//!
//! Handles are plain `Box<JobSystem>` pointers. The main callback receives
//! the handle back together with the caller's userdata pointer.

use crate::JobSystem;
use crate::config::SchedulerConfig;
use crate::error::ReturnCode;
use std::ffi::c_void;

/// Main callback as seen from C.
pub type FiberJobsMain = extern "C" fn(handle: *mut JobSystem, userdata: *mut c_void);

// Carries the caller's userdata into the main fiber, which may run on
// another thread.
struct SendPtr(*mut c_void);

unsafe impl Send for SendPtr {}

impl SendPtr {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

/// Creates a job system. Zero for either argument selects the default.
#[unsafe(no_mangle)]
pub extern "C" fn FiberJobs_Create(num_threads: usize, num_fibers: usize) -> *mut JobSystem {
    let mut config = SchedulerConfig::default();
    if num_threads != 0 {
        config.num_threads = num_threads;
    }
    if num_fibers != 0 {
        config.num_fibers = Some(num_fibers);
    }
    Box::into_raw(Box::new(JobSystem::new(config)))
}

/// Runs the job system until shutdown and returns a [`ReturnCode`].
///
/// # Safety
/// `handle` must come from `FiberJobs_Create` and not have been destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn FiberJobs_Run(
    handle: *mut JobSystem,
    callback: Option<FiberJobsMain>,
    userdata: *mut c_void,
) -> u8 {
    // SAFETY: guaranteed by the caller.
    let Some(system) = (unsafe { handle.as_ref() }) else {
        return ReturnCode::UnknownError as u8;
    };

    let userdata = SendPtr(userdata);
    let main = callback.map(|callback| -> crate::job_system::MainCallback<'_> {
        Box::new(move |system: &JobSystem| {
            callback(system as *const JobSystem as *mut JobSystem, userdata.get())
        })
    });

    ReturnCode::from(&system.run_callback(main)) as u8
}

/// Requests shutdown, optionally waiting for `FiberJobs_Run` to return.
///
/// # Safety
/// `handle` must come from `FiberJobs_Create` and not have been destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn FiberJobs_Shutdown(handle: *mut JobSystem, blocking: bool) {
    // SAFETY: guaranteed by the caller.
    if let Some(system) = unsafe { handle.as_ref() } {
        system.shutdown(blocking);
    }
}

/// Destroys a job system handle.
///
/// # Safety
/// `handle` must come from `FiberJobs_Create`, must not be running, and must
/// not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn FiberJobs_Destroy(handle: *mut JobSystem) {
    if handle.is_null() {
        return;
    }
    // SAFETY: guaranteed by the caller.
    unsafe { drop(Box::from_raw(handle)) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    extern "C" fn count_main(_handle: *mut JobSystem, userdata: *mut c_void) {
        let calls = unsafe { &*(userdata as *const AtomicUsize) };
        calls.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_run_through_c_api() {
        let calls = AtomicUsize::new(0);
        let handle = FiberJobs_Create(1, 4);
        unsafe {
            let code = FiberJobs_Run(
                handle,
                Some(count_main),
                &calls as *const AtomicUsize as *mut c_void,
            );
            assert_eq!(code, ReturnCode::Success as u8);

            let code = FiberJobs_Run(handle, Some(count_main), std::ptr::null_mut());
            assert_eq!(code, ReturnCode::AlreadyInitialized as u8);
            FiberJobs_Destroy(handle);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_null_callback() {
        let handle = FiberJobs_Create(1, 4);
        unsafe {
            let code = FiberJobs_Run(handle, None, std::ptr::null_mut());
            assert_eq!(code, ReturnCode::NullCallback as u8);
            FiberJobs_Shutdown(handle, true);
            FiberJobs_Destroy(handle);
        }
    }

    #[test]
    fn test_null_handle_ignored() {
        unsafe {
            FiberJobs_Shutdown(std::ptr::null_mut(), true);
            FiberJobs_Destroy(std::ptr::null_mut());
        }
    }
}
