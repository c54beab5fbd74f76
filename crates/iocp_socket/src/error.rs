use thiserror::Error;

/// The error type shared by every fallible operation in this crate.
///
/// Mirrors the small error taxonomy of the original socket layer: a wrapped
/// OS error code with a human-readable message, a handful of local-state
/// errors (disposed socket, role mismatch, no connection), and a dedicated
/// variant for a gracefully-closed connection so callers (and the
/// line-framing helper) can match on it structurally instead of inspecting
/// an OS error code.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An OS-level socket or address-resolution call failed.
    #[error("socket error {code}: {message}")]
    Os { code: i32, message: String },

    /// The peer closed the connection while a receive was in flight.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The entry point was called after `Dispose()`.
    #[error("socket already disposed")]
    Disposed,

    /// The entry point is not valid for the socket's current role.
    #[error("invalid operation for socket role: {0}")]
    RoleMismatch(&'static str),

    /// Send/Receive/Accept attempted on a socket with no live connection.
    #[error("no connection")]
    NoConnection,

    /// An argument was invalid (e.g. an unrecognized line terminator).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// Builds an `Error::Os` from the calling thread's last Winsock error
    /// (`WSAGetLastError`).
    pub(crate) fn last_os_error() -> Self {
        Self::from_raw_os_error(unsafe {
            windows::Win32::Networking::WinSock::WSAGetLastError().0
        })
    }

    /// Builds an `Error::Os` from a raw OS error code, formatting the message
    /// the same way the platform's own error-formatting facility would.
    pub(crate) fn from_raw_os_error(code: i32) -> Self {
        let message = windows::core::Error::from(windows::core::HRESULT::from_win32(code as u32))
            .message();
        Self::Os {
            code,
            message: message.to_string(),
        }
    }
}

impl From<windows::core::Error> for Error {
    fn from(e: windows::core::Error) -> Self {
        Self::Os {
            code: e.code().0,
            message: e.message().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
