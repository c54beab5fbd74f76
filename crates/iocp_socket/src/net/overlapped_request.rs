//! The `#[repr(C)]` descriptors handed to the OS as `*mut OVERLAPPED` for the
//! lifetime of one in-flight operation, and the thread pool callbacks that
//! reclaim them.
//!
//! `overlapped` is kept as the first field of each descriptor so the
//! `*mut OVERLAPPED` the OS hands back to the completion callback can be
//! reinterpreted as a `*mut Self` - the same layout trick `tcp_server.rs`
//! uses for its accept state. Each descriptor is boxed, leaked into a raw
//! pointer before the overlapped call that submits it, and reclaimed by
//! exactly one of: the completion callback (async completion), or the
//! caller itself (synchronous submission failure). This single-owner
//! discipline is what the original's `IoCallback` violated - it freed the
//! state on the error path and then fell through to free it again on the
//! graceful-close path below.

use crate::error::Error;
use crate::net::addr::{AddressFamily, Protocol, SocketType};
use crate::net::owned_socket::OwnedSocket;
use crate::net::socket::{SocketState, TcpSocket};
use crate::sync::Awaitable;
use std::ffi::c_void;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::sync::{Mutex, Weak};
use tracing::{event, Level};
use windows::Win32::Networking::WinSock::{self, SOCKADDR_IN, SOCKET};
use windows::Win32::System::IO::{OVERLAPPED, PTP_CALLBACK_INSTANCE, PTP_IO};

/// Not exposed as a named constant by the `windows` crate.
const SO_UPDATE_ACCEPT_CONTEXT: i32 = 0x700B;
/// Not exposed as a named constant by the `windows` crate.
pub(crate) const SO_UPDATE_CONNECT_CONTEXT: i32 = 0x7010;

/// `(sizeof(sockaddr_in) + 16) * 2`, the buffer layout `AcceptEx` requires:
/// local address then remote address, each padded by 16 bytes.
pub(crate) const ACCEPT_ADDRESS_BUFFER_LEN: usize =
    (std::mem::size_of::<SOCKADDR_IN>() + 16) * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoDirection {
    Send,
    Receive,
}

pub(crate) struct RequestKind {
    pub(crate) direction: IoDirection,
    /// The disconnect-on-failure hook (spec.md §4.3/§7): invoked whenever
    /// this I/O completes with a fatal error, or with a graceful zero-byte
    /// close. A `Weak` reference rather than a raw pointer or strong
    /// reference, fixing the original's disconnect callback reading through
    /// a `this` that may already have been freed by the time it ran.
    pub(crate) disconnect: Weak<Mutex<SocketState>>,
}

/// Which concrete descriptor a completed `*mut OVERLAPPED` points at.
///
/// A connected socket's `PTP_IO` binding is shared by `ConnectAsync` and
/// every later `SendAsync`/`ReceiveAsync` on that same socket, since a
/// `PTP_IO` dispatches every completion it is ever given to the single
/// callback fixed at `CreateThreadpoolIo` time - there is no per-submission
/// callback override. [`client_callback`] is that one callback; it reads
/// this tag off [`RequestHeader`] to learn which descriptor type it must
/// reclaim the completion as before touching any field past the header.
#[derive(Clone, Copy, PartialEq, Eq)]
enum RequestTag {
    Connect,
    Io,
}

/// Common prefix of every descriptor submitted through a connected socket's
/// shared `PTP_IO` binding. `overlapped` must stay the first field so the
/// `*mut OVERLAPPED` the OS hands back still points at the start of the
/// whole descriptor, exactly as for `AcceptRequest`; `tag` immediately
/// follows it so [`client_callback`] can read it through a `*const
/// RequestHeader` cast without yet knowing which descriptor it is.
#[repr(C)]
struct RequestHeader {
    overlapped: OVERLAPPED,
    tag: RequestTag,
}

impl RequestHeader {
    fn new(tag: RequestTag) -> Self {
        Self {
            overlapped: OVERLAPPED::default(),
            tag,
        }
    }
}

/// The outcome of a completed send or receive: the buffer handed back to its
/// owner together with the number of bytes the OS actually transferred.
/// Threading the buffer through the request and back, rather than taking a
/// borrowed slice, is what lets `SendAsync`/`ReceiveAsync` hand the OS a
/// pointer that is guaranteed to outlive the operation without requiring an
/// async runtime to pin the caller's stack around the await point.
#[derive(Debug, Clone)]
pub struct IoOutcome {
    pub buffer: Vec<u8>,
    pub bytes_transferred: usize,
}

#[repr(C)]
pub(crate) struct IoRequest {
    header: RequestHeader,
    completion: Awaitable<IoOutcome>,
    buffer: Vec<u8>,
    kind: RequestKind,
    _pin: PhantomPinned,
}

impl IoRequest {
    pub(crate) fn new(
        buffer: Vec<u8>,
        kind: RequestKind,
    ) -> (Pin<Box<Self>>, crate::sync::Awaiter<IoOutcome>) {
        let completion = Awaitable::new();
        let awaiter = completion.awaiter();
        let request = Box::pin(Self {
            header: RequestHeader::new(RequestTag::Io),
            completion,
            buffer,
            kind,
            _pin: PhantomPinned,
        });
        (request, awaiter)
    }

    pub(crate) fn buffer_ptr(self: &mut Pin<Box<Self>>) -> *mut c_void {
        // SAFETY: only the OS writes/reads through this pointer while the
        // request is pinned; we read `buffer` again only after reclaiming
        // sole ownership back from the OS in the completion callback.
        unsafe { self.as_mut().get_unchecked_mut().buffer.as_mut_ptr() as *mut c_void }
    }

    pub(crate) fn buffer_len(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Leaks `self` and returns the overlapped pointer to hand to the
    /// submitting Winsock call. Reclaimed either by [`client_callback`] or,
    /// on synchronous submission failure, by [`IoRequest::reclaim`].
    pub(crate) fn into_overlapped_ptr(self: Pin<Box<Self>>) -> *mut OVERLAPPED {
        // SAFETY: we never move the pointee while the OS may hold this
        // pointer; `into_raw` only releases the box's ownership, it does
        // not relocate the data.
        let raw = Box::into_raw(unsafe { Pin::into_inner_unchecked(self) });
        raw as *mut OVERLAPPED
    }

    /// Reclaims a request previously leaked by [`IoRequest::into_overlapped_ptr`]
    /// after the submitting call failed synchronously and no completion
    /// callback will ever fire for it.
    ///
    /// # Safety
    /// `ptr` must be the exact pointer returned by a matching
    /// `into_overlapped_ptr` call that has not already been reclaimed.
    pub(crate) unsafe fn reclaim(ptr: *mut OVERLAPPED) -> Pin<Box<Self>> {
        Pin::new_unchecked(Box::from_raw(ptr as *mut Self))
    }

    /// Settles this request's completion with `error` directly, bypassing
    /// the OS callback. Used when the submitting call fails synchronously
    /// and no completion will ever be posted for it.
    pub(crate) fn fail(self: Pin<Box<Self>>, error: Error) {
        let request = unsafe { Pin::into_inner_unchecked(self) };
        crate::net::socket::disconnect_on_failure(&request.kind.disconnect);
        let _ = request.completion.set_error(error);
    }
}

unsafe fn io_completed(overlapped: *mut c_void, io_result: u32, bytes_transferred: usize) {
    let request = Pin::into_inner_unchecked(IoRequest::reclaim(overlapped as *mut OVERLAPPED));
    let IoRequest {
        completion,
        buffer,
        kind,
        ..
    } = *request;

    if io_result != 0 {
        event!(Level::DEBUG, message = "overlapped I/O failed", direction = ?kind.direction, io_result);
        crate::net::socket::disconnect_on_failure(&kind.disconnect);
        let _ = completion.set_error(Error::from_raw_os_error(io_result as i32));
        return;
    }

    // A zero-byte completion on a connected socket - whether a send or a
    // receive - means the peer has performed an orderly shutdown; a send
    // can only observe this once the OS has nothing left to acknowledge,
    // and `MSG_WAITALL` means a short receive never reaches here still
    // pending, so zero is unambiguously "the connection is gone".
    if bytes_transferred == 0 {
        event!(Level::DEBUG, message = "peer closed connection", direction = ?kind.direction);
        crate::net::socket::disconnect_on_failure(&kind.disconnect);
        let _ = completion.set_error(Error::ConnectionReset);
        return;
    }

    let _ = completion.set_result(IoOutcome {
        buffer,
        bytes_transferred,
    });
}

#[repr(C)]
pub(crate) struct ConnectRequest {
    header: RequestHeader,
    completion: Awaitable<()>,
    socket: SOCKET,
    disconnect: Weak<Mutex<SocketState>>,
    _pin: PhantomPinned,
}

impl ConnectRequest {
    pub(crate) fn new(
        socket: SOCKET,
        disconnect: Weak<Mutex<SocketState>>,
    ) -> (Pin<Box<Self>>, crate::sync::Awaiter<()>) {
        let completion = Awaitable::new();
        let awaiter = completion.awaiter();
        let request = Box::pin(Self {
            header: RequestHeader::new(RequestTag::Connect),
            completion,
            socket,
            disconnect,
            _pin: PhantomPinned,
        });
        (request, awaiter)
    }

    pub(crate) fn into_overlapped_ptr(self: Pin<Box<Self>>) -> *mut OVERLAPPED {
        let raw = Box::into_raw(unsafe { Pin::into_inner_unchecked(self) });
        raw as *mut OVERLAPPED
    }

    /// # Safety
    /// `ptr` must be the exact pointer returned by a matching
    /// `into_overlapped_ptr` call that has not already been reclaimed.
    pub(crate) unsafe fn reclaim(ptr: *mut OVERLAPPED) -> Pin<Box<Self>> {
        Pin::new_unchecked(Box::from_raw(ptr as *mut Self))
    }

    pub(crate) fn fail(self: Pin<Box<Self>>, error: Error) {
        let request = unsafe { Pin::into_inner_unchecked(self) };
        crate::net::socket::disconnect_on_failure(&request.disconnect);
        let _ = request.completion.set_error(error);
    }
}

unsafe fn connect_completed(overlapped: *mut c_void, io_result: u32) {
    let request = Pin::into_inner_unchecked(ConnectRequest::reclaim(overlapped as *mut OVERLAPPED));
    let ConnectRequest {
        completion,
        socket,
        disconnect,
        ..
    } = *request;

    if io_result != 0 {
        crate::net::socket::disconnect_on_failure(&disconnect);
        let _ = completion.set_error(Error::from_raw_os_error(io_result as i32));
        return;
    }

    // Required after a successful ConnectEx so the socket behaves like one
    // returned by a plain `connect()` (getsockname/getpeername, shutdown,
    // and most setsockopt options are otherwise unavailable on it).
    // SAFETY: `socket` is open and was the target of the completed ConnectEx.
    let rc = unsafe {
        WinSock::setsockopt(socket, WinSock::SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, None)
    };
    if rc != 0 {
        crate::net::socket::disconnect_on_failure(&disconnect);
        let _ = completion.set_error(Error::last_os_error());
        return;
    }

    let _ = completion.set_result(());
}

/// The single completion callback bound, via [`crate::net::io_binding::IoBinding`],
/// to every connected socket's `PTP_IO` - the one `ConnectAsync` establishes
/// and `SendAsync`/`ReceiveAsync` reuse afterwards. A `PTP_IO` fixes its
/// callback at `CreateThreadpoolIo` time and dispatches every completion
/// posted through it there, so a socket that later sends or receives after
/// connecting would otherwise have its `WSASend`/`WSARecv` completions
/// delivered to a callback that only knows how to reclaim a `ConnectRequest`
/// - wrong field layout, wrong allocation size, and a completion settled on
/// the wrong type. Reading [`RequestTag`] off the common [`RequestHeader`]
/// prefix before reclaiming anything lets one callback serve both shapes.
pub(crate) unsafe extern "system" fn client_callback(
    _instance: PTP_CALLBACK_INSTANCE,
    _context: *mut c_void,
    overlapped: *mut c_void,
    io_result: u32,
    bytes_transferred: usize,
    _io: PTP_IO,
) {
    let tag = (*(overlapped as *const RequestHeader)).tag;
    match tag {
        RequestTag::Connect => connect_completed(overlapped, io_result),
        RequestTag::Io => io_completed(overlapped, io_result, bytes_transferred),
    }
}

#[repr(C)]
pub(crate) struct AcceptRequest {
    overlapped: OVERLAPPED,
    completion: Awaitable<TcpSocket>,
    listen_socket: SOCKET,
    accept_socket: Option<OwnedSocket>,
    buffer: Box<[u8]>,
    family: AddressFamily,
    socket_type: SocketType,
    protocol: Protocol,
    _pin: PhantomPinned,
}

impl AcceptRequest {
    pub(crate) fn new(
        listen_socket: SOCKET,
        accept_socket: OwnedSocket,
        family: AddressFamily,
        socket_type: SocketType,
        protocol: Protocol,
    ) -> (Pin<Box<Self>>, crate::sync::Awaiter<TcpSocket>) {
        let completion = Awaitable::new();
        let awaiter = completion.awaiter();
        let request = Box::pin(Self {
            overlapped: OVERLAPPED::default(),
            completion,
            listen_socket,
            accept_socket: Some(accept_socket),
            buffer: vec![0u8; ACCEPT_ADDRESS_BUFFER_LEN].into_boxed_slice(),
            family,
            socket_type,
            protocol,
            _pin: PhantomPinned,
        });
        (request, awaiter)
    }

    pub(crate) fn accept_socket_raw(&self) -> SOCKET {
        self.accept_socket
            .as_ref()
            .expect("accept_socket present until the request completes")
            .raw()
    }

    pub(crate) fn buffer_ptr(self: &mut Pin<Box<Self>>) -> *mut c_void {
        // SAFETY: `buffer` is never read through this pointer while pinned
        // except by the OS filling it in, and by the callback after we have
        // reclaimed exclusive ownership back from the OS.
        unsafe { self.as_mut().get_unchecked_mut().buffer.as_mut_ptr() as *mut c_void }
    }

    pub(crate) fn into_overlapped_ptr(self: Pin<Box<Self>>) -> *mut OVERLAPPED {
        let raw = Box::into_raw(unsafe { Pin::into_inner_unchecked(self) });
        raw as *mut OVERLAPPED
    }

    /// # Safety
    /// `ptr` must be the exact pointer returned by a matching
    /// `into_overlapped_ptr` call that has not already been reclaimed.
    pub(crate) unsafe fn reclaim(ptr: *mut OVERLAPPED) -> Pin<Box<Self>> {
        Pin::new_unchecked(Box::from_raw(ptr as *mut Self))
    }

    pub(crate) fn fail(self: Pin<Box<Self>>, error: Error) {
        let request = unsafe { Pin::into_inner_unchecked(self) };
        let _ = request.completion.set_error(error);
    }
}

pub(crate) unsafe extern "system" fn accept_callback(
    _instance: PTP_CALLBACK_INSTANCE,
    _context: *mut c_void,
    overlapped: *mut c_void,
    io_result: u32,
    _bytes_transferred: usize,
    _io: PTP_IO,
) {
    let request = Pin::into_inner_unchecked(AcceptRequest::reclaim(overlapped as *mut OVERLAPPED));
    let AcceptRequest {
        completion,
        listen_socket,
        mut accept_socket,
        family,
        socket_type,
        protocol,
        ..
    } = *request;

    if io_result != 0 {
        let _ = completion.set_error(Error::from_raw_os_error(io_result as i32));
        return;
    }

    let accept_socket = accept_socket
        .take()
        .expect("accept_socket present on a successful completion");
    let raw = accept_socket.raw();

    // SAFETY: `listen_socket` and `raw` are both open, valid sockets; the
    // option bytes are the listening socket's handle, as `AcceptEx` requires.
    let listen_handle = listen_socket.0;
    let rc = unsafe {
        WinSock::setsockopt(
            raw,
            WinSock::SOL_SOCKET,
            SO_UPDATE_ACCEPT_CONTEXT,
            Some(&listen_handle.to_ne_bytes()),
        )
    };
    if rc != 0 {
        let _ = completion.set_error(Error::last_os_error());
        return;
    }

    // SAFETY: `raw` is valid, open, and was opened with WSA_FLAG_OVERLAPPED
    // by `create_overlapped_socket`, and stays open for the socket's lifetime.
    let io = match unsafe { crate::net::io_binding::IoBinding::bind(raw, Some(client_callback)) } {
        Ok(io) => std::sync::Arc::new(io),
        Err(e) => {
            let _ = completion.set_error(Error::from(e));
            return;
        }
    };

    let socket = TcpSocket::from_accepted(accept_socket, io, family, socket_type, protocol);
    let _ = completion.set_result(socket);
}
