//! A single-assignment, multi-observer result slot.
//!
//! This is the Rust counterpart of `AwaitableState<T>` from the original
//! socket layer: a value settled exactly once, from any thread, observable
//! by any number of blocked waiters and registered callbacks. Unlike the
//! source, a callback registered via [`ResultCell::add_callback`] is *never*
//! invoked synchronously on the calling thread, even if the cell is already
//! settled - it is always handed to the thread pool. This removes a
//! reentrancy hazard the original had: a callback that itself calls back
//! into the cell (or the socket owning it) while the caller's lock is still
//! held further up the stack.

use crate::error::Error;
use crate::sync::threadpool;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Returned by [`ResultCell::set_result`] / [`ResultCell::set_error`] when the
/// cell has already been settled once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadySettled;

impl std::fmt::Display for AlreadySettled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("result cell already settled")
    }
}

impl std::error::Error for AlreadySettled {}

/// Returned by the timed, value-returning waits ([`ResultCell::get_for`],
/// [`ResultCell::get_until`]).
#[derive(Debug, Clone)]
pub enum TimedGetError {
    /// The deadline elapsed before the cell settled.
    Timeout,
    /// The cell settled with an error before the deadline.
    Failed(Error),
}

impl std::fmt::Display for TimedGetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out waiting for result"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TimedGetError {}

enum Slot<T> {
    Pending,
    Ready(Result<T, Error>),
}

type Continuation = Box<dyn FnOnce() + Send>;

struct Inner<T> {
    slot: Slot<T>,
    callbacks: Vec<Continuation>,
}

/// A one-shot result slot shared between a producer ([`crate::sync::Awaitable`])
/// and any number of consumers ([`crate::sync::Awaiter`]).
///
/// `T` must be `Clone`: every waiter observes the settled value independently,
/// so there is no single "final" owner to move it out to, unlike the C++
/// original's `Get()` which returned an rvalue reference to internal state on
/// every call regardless of how many times it had already been called.
pub(crate) struct ResultCell<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T: Clone> ResultCell<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slot: Slot::Pending,
                callbacks: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set_result(&self, value: T) -> Result<(), AlreadySettled> {
        self.settle(Ok(value))
    }

    pub(crate) fn set_error(&self, error: Error) -> Result<(), AlreadySettled> {
        self.settle(Err(error))
    }

    fn settle(&self, value: Result<T, Error>) -> Result<(), AlreadySettled> {
        let callbacks = {
            let mut guard = self.inner.lock().unwrap();
            if !matches!(guard.slot, Slot::Pending) {
                return Err(AlreadySettled);
            }
            guard.slot = Slot::Ready(value);
            let callbacks = std::mem::take(&mut guard.callbacks);
            self.cond.notify_all();
            callbacks
        };
        if !callbacks.is_empty() {
            // Dispatched as a single thread pool work item that runs every
            // queued callback in registration order, rather than one work
            // item per callback - the latter would let the pool's own
            // worker threads race and reorder them, which would violate
            // "callbacks queued before settlement fire in registration
            // order" (spec.md §5).
            threadpool::submit(Box::new(move || {
                for callback in callbacks {
                    callback();
                }
            }));
        }
        Ok(())
    }

    pub(crate) fn is_ready(&self) -> bool {
        !matches!(self.inner.lock().unwrap().slot, Slot::Pending)
    }

    pub(crate) fn has_result(&self) -> bool {
        matches!(self.inner.lock().unwrap().slot, Slot::Ready(Ok(_)))
    }

    pub(crate) fn has_error(&self) -> bool {
        matches!(self.inner.lock().unwrap().slot, Slot::Ready(Err(_)))
    }

    /// Non-blocking observation of the settled value, for `Future::poll`.
    pub(crate) fn peek(&self) -> Option<Result<T, Error>> {
        match &self.inner.lock().unwrap().slot {
            Slot::Ready(r) => Some(r.clone()),
            Slot::Pending => None,
        }
    }

    pub(crate) fn get(&self) -> Result<T, Error> {
        let guard = self.inner.lock().unwrap();
        let guard = self
            .cond
            .wait_while(guard, |inner| matches!(inner.slot, Slot::Pending))
            .unwrap();
        match &guard.slot {
            Slot::Ready(r) => r.clone(),
            Slot::Pending => unreachable!("wait_while only returns once pending is false"),
        }
    }

    pub(crate) fn get_for(&self, timeout: Duration) -> Result<T, TimedGetError> {
        self.get_until(Instant::now() + timeout)
    }

    pub(crate) fn get_until(&self, deadline: Instant) -> Result<T, TimedGetError> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Slot::Ready(r) = &guard.slot {
                return r.clone().map_err(TimedGetError::Failed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TimedGetError::Timeout);
            }
            let (next, result) = self.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
            if result.timed_out() && matches!(guard.slot, Slot::Pending) {
                return Err(TimedGetError::Timeout);
            }
        }
    }

    pub(crate) fn wait(&self) {
        let guard = self.inner.lock().unwrap();
        let _ = self
            .cond
            .wait_while(guard, |inner| matches!(inner.slot, Slot::Pending))
            .unwrap();
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if !matches!(guard.slot, Slot::Pending) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, result) = self.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
            if result.timed_out() && matches!(guard.slot, Slot::Pending) {
                return false;
            }
        }
    }

    /// Registers `callback` to run once the cell settles. If the cell is
    /// already settled, `callback` is dispatched to the thread pool
    /// immediately rather than run here - callers must never assume this
    /// runs synchronously.
    pub(crate) fn add_callback(&self, callback: Continuation) {
        let mut guard = self.inner.lock().unwrap();
        match guard.slot {
            Slot::Pending => guard.callbacks.push(callback),
            Slot::Ready(_) => {
                drop(guard);
                threadpool::submit(callback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_result_then_get_returns_value() {
        let cell = ResultCell::new();
        cell.set_result(42u32).unwrap();
        assert_eq!(cell.get().unwrap(), 42);
    }

    #[test]
    fn second_settle_is_rejected() {
        let cell = ResultCell::new();
        cell.set_result(1u32).unwrap();
        assert_eq!(cell.set_result(2u32), Err(AlreadySettled));
        assert_eq!(cell.set_error(Error::NoConnection), Err(AlreadySettled));
        assert_eq!(cell.get().unwrap(), 1);
    }

    #[test]
    fn get_for_times_out_while_pending() {
        let cell: ResultCell<u32> = ResultCell::new();
        let err = cell.get_for(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, TimedGetError::Timeout));
    }

    #[test]
    fn get_for_surfaces_stored_error() {
        let cell: ResultCell<u32> = ResultCell::new();
        cell.set_error(Error::NoConnection).unwrap();
        let err = cell.get_for(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, TimedGetError::Failed(Error::NoConnection)));
    }

    #[test]
    fn blocked_waiter_is_woken_by_settle_from_another_thread() {
        let cell = Arc::new(ResultCell::new());
        let writer = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.set_result(7u32).unwrap();
        });
        assert_eq!(cell.get().unwrap(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn callback_never_runs_on_the_settling_thread() {
        let cell = Arc::new(ResultCell::new());
        let (tx, rx) = std::sync::mpsc::channel();
        let settling_thread = thread::current().id();
        cell.add_callback(Box::new(move || {
            tx.send(thread::current().id()).unwrap();
        }));
        cell.set_result(1u32).unwrap();
        let callback_thread = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_ne!(callback_thread, settling_thread);
    }

    #[test]
    fn callbacks_registered_before_settle_fire_in_registration_order() {
        let cell = ResultCell::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            cell.add_callback(Box::new(move || order.lock().unwrap().push(label)));
        }
        cell.set_result(1u32).unwrap();
        // Callbacks dispatch to the thread pool, so give them a moment to run.
        for _ in 0..100 {
            if order.lock().unwrap().len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn callback_registered_after_settle_still_runs_off_thread() {
        let cell = ResultCell::new();
        cell.set_result(1u32).unwrap();
        let caller_thread = thread::current().id();
        let (tx, rx) = std::sync::mpsc::channel();
        cell.add_callback(Box::new(move || {
            tx.send(thread::current().id()).unwrap();
        }));
        let callback_thread = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_ne!(callback_thread, caller_thread);
    }
}
