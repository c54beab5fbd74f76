//! Completion-port based asynchronous TCP sockets for Windows.
//!
//! [`TcpSocket`] exposes `Bind`/`Listen`/`ConnectAsync`/`AcceptAsync`/
//! `SendAsync`/`ReceiveAsync`/`Dispose` over overlapped I/O dispatched
//! through the Win32 thread pool's I/O completion API
//! (`CreateThreadpoolIo`/`StartThreadpoolIo`). Every asynchronous entry
//! point returns an [`Awaiter`], backed by a one-shot [`sync::Awaitable`]
//! cell that can be polled as a `std::future::Future`, blocked on directly,
//! or observed through a registered callback - none of which require an
//! async runtime, since the cell drives its own wakeups off the OS thread
//! pool.

pub mod error;
pub mod net;
pub mod sync;

pub use error::{Error, Result};
pub use net::{AddressFamily, IoOutcome, Protocol, SocketType, TcpSocket, Terminator};
pub use sync::{Awaitable, Awaiter};
