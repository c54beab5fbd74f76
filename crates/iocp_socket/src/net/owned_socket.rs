//! RAII ownership of a raw Winsock `SOCKET` handle.

use windows::Win32::Networking::WinSock::{self, SOCKET};

/// Owns a `SOCKET` and closes it on drop. Moving this out of a [`super::socket::TcpSocket`]
/// (e.g. into an `AsyncIoState`-equivalent while an operation is in flight)
/// is the Rust equivalent of the original holding a raw `SOCKET` and a
/// `disposed` flag under its own mutex.
pub(crate) struct OwnedSocket(SOCKET);

impl OwnedSocket {
    /// # Safety
    /// `socket` must be a valid, open `SOCKET` not owned by anything else.
    pub(crate) unsafe fn from_raw(socket: SOCKET) -> Self {
        Self(socket)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.0 != WinSock::INVALID_SOCKET
    }

    pub(crate) fn raw(&self) -> SOCKET {
        self.0
    }

    /// Closes the socket now, idempotently. Called both from `Dispose` and
    /// from `Drop`.
    pub(crate) fn close(&mut self) {
        if self.is_valid() {
            // SAFETY: `self.0` is a socket we own exclusively.
            unsafe {
                WinSock::closesocket(self.0);
            }
            self.0 = WinSock::INVALID_SOCKET;
        }
    }
}

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        self.close();
    }
}

// A raw SOCKET is just a handle; sending ownership between threads is sound,
// matching `OwnedSocket`'s sibling handle wrappers elsewhere in this crate.
unsafe impl Send for OwnedSocket {}
