//! Thin wrapper over the Win32 thread pool's generic work-submission API.
//!
//! `ResultCell` uses this to dispatch queued continuations off its own lock,
//! exactly as `AwaitableState::AddCallback` in the source dispatched onto a
//! `PTP_WORK` item. We use `TrySubmitThreadpoolCallback` instead of manually
//! creating and submitting a `PTP_WORK` object per callback, since we have
//! nothing to reuse across calls - it is the fire-and-forget equivalent.

use std::ffi::c_void;
use tracing::{event, Level};
use windows::Win32::System::Threading::{TrySubmitThreadpoolCallback, PTP_CALLBACK_INSTANCE};

type Callback = Box<dyn FnOnce() + Send>;

/// Schedules `f` to run on a Win32 thread pool worker thread. Never runs `f`
/// on the calling thread.
pub(crate) fn submit(f: Callback) {
    let boxed: Box<Callback> = Box::new(f);
    let context = Box::into_raw(boxed) as *mut c_void;

    // SAFETY: `context` is a pointer to a boxed closure that `run` reclaims
    // and drops exactly once, whether the submission succeeds or we fall
    // back to running it inline below.
    let submitted = unsafe { TrySubmitThreadpoolCallback(Some(run), Some(context), None) };

    if submitted.is_err() {
        // Thread pool work submission can only fail under extreme resource
        // exhaustion. Losing a queued continuation silently would violate
        // the "invoked exactly once" contract, so we run it inline rather
        // than drop it - this is not the common path.
        event!(
            Level::ERROR,
            "failed to submit thread pool callback, running inline"
        );
        // SAFETY: submission failed, so the OS never took ownership of
        // `context`; reclaiming and running it here is the only reference.
        let f = unsafe { Box::from_raw(context as *mut Callback) };
        f();
    }
}

unsafe extern "system" fn run(_instance: PTP_CALLBACK_INSTANCE, context: *mut c_void) {
    // SAFETY: `context` was produced by `Box::into_raw` above and is handed
    // back to us exactly once by the thread pool.
    let f = Box::from_raw(context as *mut Callback);
    f();
}
