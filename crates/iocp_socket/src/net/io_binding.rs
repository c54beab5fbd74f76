//! RAII wrapper over a `PTP_IO` handle: the Win32 thread pool's binding
//! between a file/socket handle and a completion callback.
//!
//! This replaces a hand-rolled IOCP polling loop entirely - `CreateThreadpoolIo`
//! already does the `CreateIoCompletionPort`/`GetQueuedCompletionStatus`
//! dance internally and dispatches straight to our callback on a pool
//! thread, which is the same approach the source took.

use windows::Win32::Foundation::HANDLE;
use windows::Win32::Networking::WinSock::SOCKET;
use windows::Win32::System::IO::{
    CancelThreadpoolIo, CloseThreadpoolIo, CreateThreadpoolIo, StartThreadpoolIo, PTP_IO,
    PTP_WIN32_IO_CALLBACK,
};

pub(crate) struct IoBinding {
    io: PTP_IO,
}

impl IoBinding {
    /// Binds `socket` to `callback`, which the thread pool invokes once per
    /// completed overlapped operation started via [`IoBinding::start`].
    ///
    /// # Safety
    /// `socket` must stay open for the lifetime of this binding, and every
    /// overlapped operation started through it must use a `*mut OVERLAPPED`
    /// allocation that outlives the operation and is reclaimed exactly once,
    /// by `callback` or by the synchronous-failure path that calls
    /// [`IoBinding::cancel`].
    pub(crate) unsafe fn bind(socket: SOCKET, callback: PTP_WIN32_IO_CALLBACK) -> windows::core::Result<Self> {
        let handle = HANDLE(socket.0 as isize);
        let io = CreateThreadpoolIo(handle, callback, None, None)?;
        Ok(Self { io })
    }

    /// Must be called immediately before the overlapped API call
    /// (`WSASend`, `WSARecv`, `AcceptEx`, `ConnectEx`) that this I/O is for.
    pub(crate) fn start(&self) {
        // SAFETY: `self.io` is a valid PTP_IO for the lifetime of `self`.
        unsafe { StartThreadpoolIo(self.io) };
    }

    /// Must be called if the overlapped call that followed `start` failed
    /// synchronously (i.e. did not return `ERROR_IO_PENDING`), since no
    /// completion callback will fire to balance the `start` call.
    pub(crate) fn cancel(&self) {
        // SAFETY: `self.io` is a valid PTP_IO for the lifetime of `self`.
        unsafe { CancelThreadpoolIo(self.io) };
    }
}

impl Drop for IoBinding {
    fn drop(&mut self) {
        // SAFETY: `self.io` was created by `CreateThreadpoolIo` in `bind`
        // and is closed exactly once, here.
        unsafe { CloseThreadpoolIo(self.io) };
    }
}

// The underlying PTP_IO is documented by Win32 as safe to use from any
// thread once created.
unsafe impl Send for IoBinding {}
unsafe impl Sync for IoBinding {}
