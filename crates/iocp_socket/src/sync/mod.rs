//! Runtime-agnostic async primitives shared by every asynchronous entry
//! point on [`crate::net::TcpSocket`].

mod awaitable;
mod result_cell;
mod threadpool;

pub use awaitable::{wait_all, wait_for_all, wait_until_all, Awaitable, Awaiter, Waitable};
pub use result_cell::{AlreadySettled, TimedGetError};
pub(crate) use threadpool::submit;
