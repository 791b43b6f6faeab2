//! Thin wrappers over driver calls the safe cudarc surface does not
//! cover: cross-stream event waits and host completion callbacks.

use std::ffi::c_void;

use cudarc::driver::sys as cuda_sys;

use hetstream_core::error::{HetstreamError, Result};

use crate::event::SharedEvent;
use crate::stream::SharedStream;

/// Makes `stream` wait, GPU-side and without blocking the host, for
/// `event` to occur.
///
/// Work queued on `stream` after this call runs only once `event` has
/// occurred; work queued before it is unaffected.
pub(crate) fn wait_event(stream: &SharedStream, event: &SharedEvent) -> Result<()> {
    let rc = unsafe { cuda_sys::cuStreamWaitEvent(stream.raw(), event.raw(), 0) };
    if rc != cuda_sys::CUresult::CUDA_SUCCESS {
        return Err(HetstreamError::backend(format!(
            "cuStreamWaitEvent failed: {:?}",
            rc
        )));
    }
    Ok(())
}

type HostCallback = Box<dyn FnOnce() + Send + 'static>;

unsafe extern "C" fn host_callback_trampoline(user_data: *mut c_void) {
    // Reclaims the double box handed to the driver in
    // launch_host_callback; the driver invokes this exactly once.
    let callback = unsafe { Box::from_raw(user_data as *mut HostCallback) };
    callback();
}

/// Registers `f` to run on a driver-managed host thread once all work
/// queued so far on `stream` has completed.
///
/// `f` must not issue driver calls that could deadlock against the
/// stream it is attached to.
pub(crate) fn launch_host_callback<F>(stream: &SharedStream, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let boxed: *mut HostCallback = Box::into_raw(Box::new(Box::new(f)));
    let rc = unsafe {
        cuda_sys::cuLaunchHostFunc(
            stream.raw(),
            Some(host_callback_trampoline),
            boxed as *mut c_void,
        )
    };
    if rc != cuda_sys::CUresult::CUDA_SUCCESS {
        // The driver never took ownership; reclaim the box so the
        // closure (and anything it captured) is released.
        unsafe { drop(Box::from_raw(boxed)) };
        return Err(HetstreamError::backend(format!(
            "cuLaunchHostFunc failed: {:?}",
            rc
        )));
    }
    Ok(())
}
