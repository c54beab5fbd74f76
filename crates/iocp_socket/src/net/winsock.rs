//! Process-wide Winsock bookkeeping: one-time `WSAStartup`, and the
//! `ConnectEx` extension function pointer lookup.
//!
//! The original called `WSAStartup` from every `Socket` constructor *and*
//! from `operator=(Socket&&)`, so every move-assignment re-initialized
//! Winsock for the whole process. We call it exactly once per process via
//! [`std::sync::Once`], which is both correct and the idiomatic fix.

use crate::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use windows::Win32::Networking::WinSock::{
    self, SOCKET, SIO_GET_EXTENSION_FUNCTION_POINTER, WSADATA,
};

static WSA_INIT: Once = Once::new();

/// Ensures `WSAStartup` has been called for this process. Safe to call from
/// every `TcpSocket` constructor; only the first call does any work.
pub(crate) fn ensure_initialized() {
    WSA_INIT.call_once(|| {
        let mut data = WSADATA::default();
        // SAFETY: `data` is a valid out-param for the duration of the call.
        let rc = unsafe { WinSock::WSAStartup(0x0202, &mut data) };
        if rc != 0 {
            // There is no recoverable path if Winsock itself cannot start;
            // every subsequent socket call would fail anyway.
            panic!("WSAStartup failed with error {rc}");
        }
    });
}

/// A cached Winsock extension function pointer, looked up lazily via
/// `WSAIoctl`/`SIO_GET_EXTENSION_FUNCTION_POINTER` the first time it is
/// needed on a live socket. `ConnectEx`, unlike `AcceptEx`, has no
/// statically-linkable import in `ws2_32.dll`.
pub(crate) struct Extension {
    guid: WinSock::GUID,
    cached: AtomicUsize,
}

impl Extension {
    const fn new(guid: WinSock::GUID) -> Self {
        Self {
            guid,
            cached: AtomicUsize::new(0),
        }
    }

    /// Returns the function pointer for this extension on `socket`, looking
    /// it up and caching it on first use.
    pub(crate) fn get(&self, socket: SOCKET) -> Result<usize, Error> {
        let cached = self.cached.load(Ordering::Acquire);
        if cached != 0 {
            return Ok(cached);
        }

        let mut fn_pointer: usize = 0;
        let mut bytes_returned: u32 = 0;
        // SAFETY: `self.guid` and `fn_pointer` are valid in/out buffers of
        // the sizes passed; `WSAIoctl` writes exactly `size_of::<usize>()`
        // bytes into `fn_pointer` on success.
        let rc = unsafe {
            WinSock::WSAIoctl(
                socket,
                SIO_GET_EXTENSION_FUNCTION_POINTER,
                Some(&self.guid as *const _ as *const std::ffi::c_void),
                std::mem::size_of::<WinSock::GUID>() as u32,
                Some(&mut fn_pointer as *mut _ as *mut std::ffi::c_void),
                std::mem::size_of::<usize>() as u32,
                &mut bytes_returned,
                None,
                None,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }

        self.cached.store(fn_pointer, Ordering::Release);
        Ok(fn_pointer)
    }
}

/// `WSAID_CONNECTEX`, from `mswsock.h`.
static CONNECTEX: Extension = Extension::new(WinSock::GUID {
    data1: 0x25a207b9,
    data2: 0xddf3,
    data3: 0x4660,
    data4: [0x8e, 0xe9, 0x76, 0xe5, 0x8c, 0x74, 0x06, 0x3e],
});

type ConnectExFn = unsafe extern "system" fn(
    s: SOCKET,
    name: *const WinSock::SOCKADDR,
    namelen: i32,
    lpsendbuffer: *const std::ffi::c_void,
    dwsenddatalength: u32,
    lpdwbytessent: *mut u32,
    lpoverlapped: *mut windows::Win32::System::IO::OVERLAPPED,
) -> windows::core::BOOL;

/// Looks up and invokes `ConnectEx` on `socket`, returning the raw `BOOL`
/// result exactly as `AcceptEx` does - the caller inspects `GetLastError`
/// itself to tell a genuinely failed submission from `ERROR_IO_PENDING`.
///
/// # Safety
/// `overlapped` must point to storage that remains valid and immovable until
/// the I/O completion callback fires, exactly as required by `WSASend`/
/// `WSARecv`/`AcceptEx`.
pub(crate) unsafe fn connect_ex(
    socket: SOCKET,
    addr: *const WinSock::SOCKADDR,
    addr_len: i32,
    overlapped: *mut windows::Win32::System::IO::OVERLAPPED,
) -> Result<windows::core::BOOL, Error> {
    let ptr = CONNECTEX.get(socket)?;
    let connect_ex: ConnectExFn = std::mem::transmute(ptr);
    let mut bytes_sent: u32 = 0;
    let ok = connect_ex(
        socket,
        addr,
        addr_len,
        std::ptr::null(),
        0,
        &mut bytes_sent,
        overlapped,
    );
    Ok(ok)
}
