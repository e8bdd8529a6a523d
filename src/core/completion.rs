//! Write-once completion cell shared between an operation's driver task and
//! its consumers.
//!
//! An [`OpHandle`] is the caller-facing face of every operation: it can be
//! used as a blocking future (`wait` + `result`), an async future (`done`),
//! or a callback registration point (`subscribe`). Completion happens exactly
//! once; listeners registered after completion fire immediately and
//! synchronously with the already-known result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use super::error::{ContractError, Error};

/// The delivered outcome of an operation.
pub type OpResult<T> = Result<T, Error>;

type Listener<T> = Box<dyn FnOnce(&OpResult<T>) + Send>;

struct Cell<T> {
    result: Option<OpResult<T>>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T> {
    cell: Mutex<Cell<T>>,
    unblocked: Condvar,
    notify: Notify,
}

/// Handle to an asynchronous operation's eventual result.
///
/// Cloning the handle is cheap; all clones observe the same completion.
pub struct OpHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for OpHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for OpHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.inner.cell.lock();
        match &cell.result {
            None => write!(f, "<operation pending>"),
            Some(Ok(_)) => write!(f, "<operation done>"),
            Some(Err(e)) => write!(f, "<operation failed: {e}>"),
        }
    }
}

impl<T: Clone + Send + 'static> OpHandle<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cell: Mutex::new(Cell {
                    result: None,
                    listeners: Vec::new(),
                }),
                unblocked: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// True once the operation reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.inner.cell.lock().result.is_some()
    }

    /// True if the operation completed with a captured failure.
    pub fn is_failed(&self) -> bool {
        matches!(self.inner.cell.lock().result, Some(Err(_)))
    }

    /// Clone of the outcome, if complete.
    pub fn outcome(&self) -> Option<OpResult<T>> {
        self.inner.cell.lock().result.clone()
    }

    /// The success value (cloned) or the captured failure.
    ///
    /// Fails with [`ContractError::NotReady`] before completion.
    pub fn result(&self) -> OpResult<T> {
        match self.inner.cell.lock().result.clone() {
            Some(res) => res,
            None => Err(ContractError::NotReady.into()),
        }
    }

    /// Block the calling thread until the operation completes or the
    /// timeout elapses. Returns whether the operation is now complete.
    ///
    /// Must not be called from the task driving this operation's own
    /// completion: that would self-deadlock. Timing out does not cancel
    /// the operation.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut cell = self.inner.cell.lock();
        match timeout {
            None => {
                while cell.result.is_none() {
                    self.inner.unblocked.wait(&mut cell);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while cell.result.is_none() {
                    if self.inner.unblocked.wait_until(&mut cell, deadline).timed_out() {
                        return cell.result.is_some();
                    }
                }
                true
            }
        }
    }

    /// Wait for completion without blocking a thread.
    pub async fn done(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    /// Register a completion listener.
    ///
    /// Listeners fire exactly once, in registration order, on whatever
    /// thread triggers completion. If the operation is already complete the
    /// listener is invoked synchronously before `subscribe` returns.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: FnOnce(&OpResult<T>) + Send + 'static,
    {
        let already = {
            let mut cell = self.inner.cell.lock();
            match &cell.result {
                Some(res) => Some(res.clone()),
                None => {
                    cell.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        if let Some(res) = already {
            listener(&res);
        }
    }

    /// Deliver the result. Listeners run first (in registration order),
    /// then blocked and async waiters are released.
    ///
    /// Returns false if the operation was already complete; duplicate
    /// deliveries are ignored since asynchronous retries can race into the
    /// terminal state.
    pub(crate) fn complete(&self, result: OpResult<T>) -> bool {
        let listeners = {
            let mut cell = self.inner.cell.lock();
            if cell.result.is_some() {
                tracing::debug!("duplicate terminal delivery ignored");
                return false;
            }
            cell.result = Some(result.clone());
            std::mem::take(&mut cell.listeners)
        };
        for listener in listeners {
            listener(&result);
        }
        self.inner.unblocked.notify_all();
        self.inner.notify.notify_waiters();
        true
    }

    /// Derive a handle whose result is computed from this one's.
    pub(crate) fn map<U, F>(&self, f: F) -> OpHandle<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(OpResult<T>) -> OpResult<U> + Send + 'static,
    {
        let mapped = OpHandle::new();
        let out = mapped.clone();
        self.subscribe(move |res| {
            out.complete(f(res.clone()));
        });
        mapped
    }

    /// A handle that is already complete. Used for argument-validation
    /// failures that must surface through the normal result path.
    pub(crate) fn ready(result: OpResult<T>) -> Self {
        let handle = Self::new();
        handle.complete(result);
        handle
    }

    /// Whether two handles refer to the same operation.
    pub(crate) fn same_op(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
