//! The producer/consumer pair built on top of [`ResultCell`].
//!
//! `Awaitable<T>` is the write side: whoever starts an asynchronous operation
//! owns one and settles it exactly once, typically from an I/O completion
//! callback. `Awaiter<T>` is the read side handed back to the caller; it is
//! cheaply `Clone`-able (it is just a shared pointer to the cell) and can be
//! driven three ways, matching the three ways `Awaiter<T>` was consumable in
//! the original: as a `std::future::Future` (`.await`), blocked on directly
//! (`get`/`get_for`/`get_until`/`wait`/`wait_for`/`wait_until`), or observed
//! via a registered continuation (`then`).

use crate::error::Error;
use crate::sync::result_cell::{AlreadySettled, ResultCell, TimedGetError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// The write side of a one-shot asynchronous result.
pub struct Awaitable<T> {
    cell: Arc<ResultCell<T>>,
}

impl<T: Clone> Awaitable<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(ResultCell::new()),
        }
    }

    /// Settles the awaitable with a successful value. Returns
    /// [`AlreadySettled`] if this awaitable has already been settled.
    pub fn set_result(&self, value: T) -> Result<(), AlreadySettled> {
        self.cell.set_result(value)
    }

    /// Settles the awaitable with an error. Returns [`AlreadySettled`] if
    /// this awaitable has already been settled.
    pub fn set_error(&self, error: Error) -> Result<(), AlreadySettled> {
        self.cell.set_error(error)
    }

    /// Returns a new handle to the read side. Any number of these may be
    /// created and used independently.
    pub fn awaiter(&self) -> Awaiter<T> {
        Awaiter {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone> Default for Awaitable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The read side of a one-shot asynchronous result. Cloning shares the
/// underlying cell; it does not duplicate the result.
pub struct Awaiter<T> {
    cell: Arc<ResultCell<T>>,
}

impl<T> Clone for Awaiter<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone> Awaiter<T> {
    pub fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }

    pub fn has_result(&self) -> bool {
        self.cell.has_result()
    }

    pub fn has_error(&self) -> bool {
        self.cell.has_error()
    }

    /// Blocks the calling thread until settled, then returns the value or
    /// propagates the stored error.
    pub fn get(&self) -> Result<T, Error> {
        self.cell.get()
    }

    pub fn get_for(&self, timeout: Duration) -> Result<T, TimedGetError> {
        self.cell.get_for(timeout)
    }

    pub fn get_until(&self, deadline: Instant) -> Result<T, TimedGetError> {
        self.cell.get_until(deadline)
    }

    /// Blocks until settled without surfacing the value or error.
    pub fn wait(&self) {
        self.cell.wait()
    }

    /// Blocks until settled or `timeout` elapses. Returns whether the cell
    /// settled in time.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.cell.wait_for(timeout)
    }

    /// As [`Awaiter::wait_for`], but against an absolute deadline.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        self.cell.wait_until(deadline)
    }

    /// Registers `continuation` to run once this awaiter settles. Always
    /// dispatched to the thread pool, never run synchronously by this call.
    pub fn then<F>(&self, continuation: F)
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
        T: Send + 'static,
    {
        let cell = Arc::clone(&self.cell);
        self.cell.add_callback(Box::new(move || {
            let result = cell.peek().expect("callback only runs once settled");
            continuation(result);
        }));
    }
}

impl<T: Clone + Send + 'static> Future for Awaiter<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.cell.peek() {
            return Poll::Ready(result);
        }
        let waker = cx.waker().clone();
        // If the cell settles in the window between the peek above and this
        // registration, `add_callback` dispatches the waker callback to the
        // thread pool immediately rather than missing the wakeup.
        self.cell.add_callback(Box::new(move || waker.wake()));
        Poll::Pending
    }
}

/// Anything that can be waited on without extracting a value, letting
/// [`wait_all`], [`wait_for_all`] and [`wait_until_all`] operate over a
/// heterogeneous group of `Awaiter<T>`s.
pub trait Waitable {
    fn wait(&self);
    fn wait_for(&self, timeout: Duration) -> bool;
    fn wait_until(&self, deadline: Instant) -> bool;
}

impl<T: Clone> Waitable for Awaiter<T> {
    fn wait(&self) {
        Awaiter::wait(self)
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        Awaiter::wait_for(self, timeout)
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        Awaiter::wait_until(self, deadline)
    }
}

/// Blocks until every awaiter in `awaiters` has settled.
pub fn wait_all(awaiters: &[&dyn Waitable]) {
    for awaiter in awaiters {
        awaiter.wait();
    }
}

/// Blocks until every awaiter has settled or `timeout` elapses for one of
/// them, whichever comes first. Short-circuits on the first timeout.
pub fn wait_for_all(awaiters: &[&dyn Waitable], timeout: Duration) -> bool {
    awaiters.iter().all(|a| a.wait_for(timeout))
}

/// As [`wait_for_all`], but against an absolute deadline shared by every
/// awaiter.
pub fn wait_until_all(awaiters: &[&dyn Waitable], deadline: Instant) -> bool {
    awaiters.iter().all(|a| a.wait_until(deadline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn awaiter_sees_result_settled_from_another_thread() {
        let awaitable: Awaitable<u32> = Awaitable::new();
        let awaiter = awaitable.awaiter();
        let handle = thread::spawn(move || {
            awaitable.set_result(5).unwrap();
        });
        assert_eq!(awaiter.get().unwrap(), 5);
        handle.join().unwrap();
    }

    #[test]
    fn cloned_awaiters_observe_the_same_settle() {
        let awaitable: Awaitable<u32> = Awaitable::new();
        let a = awaitable.awaiter();
        let b = a.clone();
        awaitable.set_result(9).unwrap();
        assert_eq!(a.get().unwrap(), 9);
        assert_eq!(b.get().unwrap(), 9);
    }

    #[test]
    fn wait_for_all_short_circuits_on_first_pending() {
        let ready: Awaitable<u32> = Awaitable::new();
        ready.set_result(1).unwrap();
        let pending: Awaitable<u32> = Awaitable::new();
        let a = ready.awaiter();
        let b = pending.awaiter();
        let all_ready = wait_for_all(&[&a, &b], Duration::from_millis(20));
        assert!(!all_ready);
    }

    #[test]
    fn awaiter_is_pollable_as_a_future() {
        let awaitable: Awaitable<u32> = Awaitable::new();
        let awaiter = awaitable.awaiter();
        awaitable.set_result(3).unwrap();
        let value = futures::executor::block_on(awaiter).unwrap();
        assert_eq!(value, 3);
    }
}
