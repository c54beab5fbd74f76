//! The public `TcpSocket` type: Bind/Listen/ConnectAsync/AcceptAsync/
//! SendAsync/ReceiveAsync/Dispose over overlapped I/O, bound to the Win32
//! thread pool's completion machinery via [`IoBinding`].
//!
//! A `TcpSocket` is `Clone`: cloning shares the same underlying OS socket and
//! state rather than duplicating it, the same way the original's role and
//! `disposed` flag lived behind one mutex shared by every reference to a
//! `Socket`. `Dispose` is idempotent across every clone.

use crate::error::Error;
use crate::net::addr::{self, AddressFamily, Protocol, SocketType};
use crate::net::io_binding::IoBinding;
use crate::net::line::{self, Terminator};
use crate::net::overlapped_request::{
    self, AcceptRequest, ConnectRequest, IoOutcome, IoRequest, RequestKind,
};
use crate::net::owned_socket::OwnedSocket;
use crate::net::winsock;
use crate::sync::Awaiter;
use std::sync::{Arc, Mutex};
use tracing::{event, Level};
use windows::Win32::Networking::WinSock::{self, SOCKET, WSA_FLAG_OVERLAPPED};

/// The role a socket is operating in. A freshly constructed socket starts
/// `Unbound` and transitions exactly once, via `Bind` (towards `Server`) or
/// `ConnectAsync`/`from_accepted` (towards `Client`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unbound,
    Server,
    Client,
}

pub(crate) struct SocketState {
    socket: OwnedSocket,
    io: Option<Arc<IoBinding>>,
    role: Role,
    disposed: bool,
    connected: bool,
    family: AddressFamily,
    socket_type: SocketType,
    protocol: Protocol,
}

impl SocketState {
    /// Tears the socket down in place: closes the handle, drops the I/O
    /// binding, and marks the socket disposed so no further operation can be
    /// submitted through it. Idempotent.
    pub(crate) fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.connected = false;
        self.socket.close();
        self.io = None;
    }
}

/// Upgrades `state` and disposes it, the disconnect-on-failure hook a
/// connection-fatal I/O error (or a remotely-detected graceful close)
/// invokes per spec.md §4.3/§7. A no-op if the socket has already been torn
/// down or dropped, fixing the original's disconnect callback reading
/// through a `this` that might already be freed.
pub(crate) fn disconnect_on_failure(state: &std::sync::Weak<Mutex<SocketState>>) {
    if let Some(state) = state.upgrade() {
        state.lock().unwrap().dispose();
    }
}

/// An asynchronous TCP socket built on Win32 thread pool I/O.
#[derive(Clone)]
pub struct TcpSocket {
    state: Arc<Mutex<SocketState>>,
}

impl TcpSocket {
    /// Creates a new, unbound, unconnected socket of the given kind. Does
    /// not touch the network until `Bind`/`Listen`/`ConnectAsync`.
    pub fn new(family: AddressFamily, socket_type: SocketType, protocol: Protocol) -> Result<Self, Error> {
        winsock::ensure_initialized();
        let socket = create_overlapped_socket(family, socket_type, protocol)?;
        Ok(Self {
            state: Arc::new(Mutex::new(SocketState {
                socket,
                io: None,
                role: Role::Unbound,
                disposed: false,
                connected: false,
                family,
                socket_type,
                protocol,
            })),
        })
    }

    pub(crate) fn from_accepted(
        socket: OwnedSocket,
        io: Arc<IoBinding>,
        family: AddressFamily,
        socket_type: SocketType,
        protocol: Protocol,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SocketState {
                socket,
                io: Some(io),
                role: Role::Client,
                disposed: false,
                connected: true,
                family,
                socket_type,
                protocol,
            })),
        }
    }

    /// Binds the socket to `host:port`. Valid only on an `Unbound` socket.
    pub fn bind(&self, host: &str, port: u16) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        if guard.disposed {
            return Err(Error::Disposed);
        }
        if guard.role != Role::Unbound {
            return Err(Error::RoleMismatch("Bind requires an unbound socket"));
        }
        let resolved = addr::resolve(
            Some(host),
            port,
            guard.family,
            guard.socket_type,
            guard.protocol,
        )?;
        // SAFETY: `resolved` was built by `getaddrinfo` for this socket's
        // family and is valid for the duration of this call.
        let rc = unsafe {
            WinSock::bind(guard.socket.raw(), resolved.as_sockaddr(), resolved.len())
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        guard.role = Role::Server;
        event!(Level::DEBUG, message = "socket bound", host, port);
        Ok(())
    }

    /// Starts listening on a previously `Bind`-ed socket.
    pub fn listen(&self, backlog: i32) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        if guard.disposed {
            return Err(Error::Disposed);
        }
        if guard.role != Role::Server {
            return Err(Error::RoleMismatch("Listen requires a bound socket"));
        }
        // SAFETY: `guard.socket` is a valid, bound socket.
        let rc = unsafe { WinSock::listen(guard.socket.raw(), backlog) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        // SAFETY: the socket was opened with WSA_FLAG_OVERLAPPED and stays
        // open for the lifetime of this binding.
        let io = unsafe {
            IoBinding::bind(guard.socket.raw(), Some(overlapped_request::accept_callback))
        }?;
        guard.io = Some(Arc::new(io));
        event!(Level::DEBUG, message = "socket listening", backlog);
        Ok(())
    }

    /// Accepts one pending connection. Valid only on a listening socket.
    pub fn accept_async(&self) -> Awaiter<TcpSocket> {
        let (listen_raw, io, family, socket_type, protocol) = {
            let guard = self.state.lock().unwrap();
            if guard.disposed {
                return failed(Error::Disposed);
            }
            if guard.role != Role::Server {
                return failed(Error::RoleMismatch("AcceptAsync requires a listening socket"));
            }
            let Some(io) = guard.io.clone() else {
                return failed(Error::RoleMismatch("AcceptAsync requires Listen to have been called"));
            };
            (guard.socket.raw(), io, guard.family, guard.socket_type, guard.protocol)
        };

        let accept_socket = match create_overlapped_socket(family, socket_type, protocol) {
            Ok(s) => s,
            Err(e) => return failed(e),
        };

        let (mut request, awaiter) = AcceptRequest::new(listen_raw, accept_socket, family, socket_type, protocol);
        let accept_raw = request.accept_socket_raw();
        let buffer_ptr = request.buffer_ptr();
        let overlapped_ptr = request.into_overlapped_ptr();

        io.start();
        let half_len = (overlapped_request::ACCEPT_ADDRESS_BUFFER_LEN / 2) as u32;
        let mut bytes_received: u32 = 0;
        // SAFETY: `buffer_ptr`/`overlapped_ptr` point at storage owned by the
        // request, leaked above and reclaimed either here or by
        // `accept_callback`.
        let ok = unsafe {
            WinSock::AcceptEx(
                listen_raw,
                accept_raw,
                buffer_ptr,
                0,
                half_len,
                half_len,
                &mut bytes_received,
                overlapped_ptr,
            )
        };
        if !ok.as_bool() {
            let err = unsafe { WinSock::WSAGetLastError() };
            if err != WinSock::WSA_IO_PENDING {
                io.cancel();
                // SAFETY: submission failed synchronously; no completion
                // will ever be posted for `overlapped_ptr`.
                unsafe { AcceptRequest::reclaim(overlapped_ptr) }.fail(Error::from_raw_os_error(err.0));
            }
        }
        awaiter
    }

    /// Connects to `host:port`. Valid only on an `Unbound` socket.
    pub fn connect_async(&self, host: &str, port: u16) -> Awaiter<()> {
        let (raw, family, socket_type, protocol) = {
            let guard = self.state.lock().unwrap();
            if guard.disposed {
                return failed(Error::Disposed);
            }
            if guard.role != Role::Unbound {
                return failed(Error::RoleMismatch("ConnectAsync requires an unbound socket"));
            }
            (guard.socket.raw(), guard.family, guard.socket_type, guard.protocol)
        };

        let resolved = match addr::resolve(Some(host), port, family, socket_type, protocol) {
            Ok(r) => r,
            Err(e) => return failed(e),
        };
        // ConnectEx requires the socket be explicitly bound first.
        let local = match addr::resolve(None, 0, family, socket_type, protocol) {
            Ok(r) => r,
            Err(e) => return failed(e),
        };
        // SAFETY: `local` is a valid wildcard sockaddr for this socket's family.
        let rc = unsafe { WinSock::bind(raw, local.as_sockaddr(), local.len()) };
        if rc != 0 {
            return failed(Error::last_os_error());
        }

        let io = match unsafe { IoBinding::bind(raw, Some(overlapped_request::client_callback)) } {
            Ok(io) => Arc::new(io),
            Err(e) => return failed(Error::from(e)),
        };

        {
            let mut guard = self.state.lock().unwrap();
            guard.io = Some(Arc::clone(&io));
        }

        let (request, awaiter) = ConnectRequest::new(raw, Arc::downgrade(&self.state));
        let overlapped_ptr = request.into_overlapped_ptr();

        io.start();
        // SAFETY: `overlapped_ptr` points at storage leaked above, reclaimed
        // either here or by `client_callback`.
        let result = unsafe {
            winsock::connect_ex(raw, resolved.as_sockaddr(), resolved.len(), overlapped_ptr)
        };
        match result {
            Ok(ok) if !ok.as_bool() => {
                let err = unsafe { WinSock::WSAGetLastError() };
                if err != WinSock::WSA_IO_PENDING {
                    io.cancel();
                    unsafe { ConnectRequest::reclaim(overlapped_ptr) }.fail(Error::from_raw_os_error(err.0));
                }
            }
            Err(e) => {
                io.cancel();
                unsafe { ConnectRequest::reclaim(overlapped_ptr) }.fail(e);
            }
            Ok(_) => {}
        }

        let state = Arc::clone(&self.state);
        let outer: crate::sync::Awaitable<()> = crate::sync::Awaitable::new();
        let outer_awaiter = outer.awaiter();
        awaiter.then(move |result| {
            if result.is_ok() {
                let mut guard = state.lock().unwrap();
                guard.role = Role::Client;
                guard.connected = true;
            }
            let _ = match result {
                Ok(()) => outer.set_result(()),
                Err(e) => outer.set_error(e),
            };
        });
        outer_awaiter
    }

    /// Sends `buffer`, returning the number of bytes transferred together
    /// with the buffer for reuse.
    pub fn send_async(&self, buffer: Vec<u8>) -> Awaiter<IoOutcome> {
        let (raw, io) = match self.validate_connected() {
            Ok(v) => v,
            Err(e) => return failed(e),
        };

        let kind = RequestKind {
            direction: overlapped_request::IoDirection::Send,
            disconnect: Arc::downgrade(&self.state),
        };
        let (mut request, awaiter) = IoRequest::new(buffer, kind);
        let mut wsabuf = WinSock::WSABUF {
            len: request.buffer_len(),
            buf: windows::core::PSTR(request.buffer_ptr() as *mut u8),
        };
        let overlapped_ptr = request.into_overlapped_ptr();

        io.start();
        let mut bytes_sent: u32 = 0;
        // SAFETY: `overlapped_ptr` points at storage leaked above, reclaimed
        // either here or by `client_callback`; `wsabuf` borrows that same
        // buffer for the duration of this call only.
        let rc = unsafe {
            WinSock::WSASend(
                raw,
                std::slice::from_mut(&mut wsabuf),
                Some(&mut bytes_sent),
                0,
                Some(overlapped_ptr),
                None,
            )
        };
        if rc != 0 {
            let err = unsafe { WinSock::WSAGetLastError() };
            if err != WinSock::WSA_IO_PENDING {
                io.cancel();
                unsafe { IoRequest::reclaim(overlapped_ptr) }.fail(Error::from_raw_os_error(err.0));
            }
        }
        awaiter
    }

    /// Receives into `buffer`, returning the number of bytes transferred
    /// together with the buffer. A gracefully closed connection surfaces as
    /// [`Error::ConnectionReset`] rather than a successful zero-byte read.
    pub fn receive_async(&self, buffer: Vec<u8>) -> Awaiter<IoOutcome> {
        let (raw, io) = match self.validate_connected() {
            Ok(v) => v,
            Err(e) => return failed(e),
        };

        let kind = RequestKind {
            direction: overlapped_request::IoDirection::Receive,
            disconnect: Arc::downgrade(&self.state),
        };
        let (mut request, awaiter) = IoRequest::new(buffer, kind);
        let mut wsabuf = WinSock::WSABUF {
            len: request.buffer_len(),
            buf: windows::core::PSTR(request.buffer_ptr() as *mut u8),
        };
        let overlapped_ptr = request.into_overlapped_ptr();

        io.start();
        let mut bytes_received: u32 = 0;
        // `MSG_WAITALL`: a receive only completes once the buffer is full or
        // the connection closes, per spec.md §4.4/§8 invariant 6, rather
        // than settling early with whatever happened to already be queued.
        let mut flags: u32 = WinSock::MSG_WAITALL.0 as u32;
        // SAFETY: see `send_async`.
        let rc = unsafe {
            WinSock::WSARecv(
                raw,
                std::slice::from_mut(&mut wsabuf),
                Some(&mut bytes_received),
                &mut flags,
                Some(overlapped_ptr),
                None,
            )
        };
        if rc != 0 {
            let err = unsafe { WinSock::WSAGetLastError() };
            if err != WinSock::WSA_IO_PENDING {
                io.cancel();
                unsafe { IoRequest::reclaim(overlapped_ptr) }.fail(Error::from_raw_os_error(err.0));
            }
        }
        awaiter
    }

    /// Reads one line, delimited by `terminator`, off this socket.
    pub fn receive_line_async(&self, terminator: Terminator) -> Awaiter<String> {
        line::receive_line_async(self, terminator)
    }

    /// Closes the socket. Idempotent: a second call, from any clone, is a
    /// no-op rather than an error.
    pub fn dispose(&self) {
        self.state.lock().unwrap().dispose();
    }

    fn validate_connected(&self) -> Result<(SOCKET, Arc<IoBinding>), Error> {
        let guard = self.state.lock().unwrap();
        if guard.disposed {
            return Err(Error::Disposed);
        }
        if guard.role != Role::Client || !guard.connected {
            return Err(Error::NoConnection);
        }
        let io = guard.io.clone().ok_or(Error::NoConnection)?;
        Ok((guard.socket.raw(), io))
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        // Only the last clone actually tears anything down; `dispose` is
        // idempotent and cheap to call redundantly from every clone's drop.
        if Arc::strong_count(&self.state) == 1 {
            self.dispose();
        }
    }
}

fn create_overlapped_socket(
    family: AddressFamily,
    socket_type: SocketType,
    protocol: Protocol,
) -> Result<OwnedSocket, Error> {
    winsock::ensure_initialized();
    // SAFETY: all arguments are valid; `WSA_FLAG_OVERLAPPED` is required for
    // every socket used with the thread pool I/O API.
    let raw = unsafe {
        WinSock::WSASocketW(
            family.to_winsock().0 as i32,
            socket_type.to_winsock().0,
            protocol.to_winsock().0,
            None,
            0,
            WSA_FLAG_OVERLAPPED,
        )
    };
    if raw == WinSock::INVALID_SOCKET {
        return Err(Error::last_os_error());
    }
    // SAFETY: `raw` was just created above and is owned exclusively here.
    Ok(unsafe { OwnedSocket::from_raw(raw) })
}

fn failed<T: Clone>(error: Error) -> Awaiter<T> {
    let awaitable: crate::sync::Awaitable<T> = crate::sync::Awaitable::new();
    let awaiter = awaitable.awaiter();
    let _ = awaitable.set_error(error);
    awaiter
}
