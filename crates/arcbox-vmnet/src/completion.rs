//! One-shot completions for asynchronous host commands.
//!
//! vmnet answers interface creation, teardown and port-forwarding commands by
//! invoking a completion block on a dispatch queue the caller does not
//! control. [`await_once`] turns that into a blocking call: it creates a fresh
//! single-use cell, hands a [`Completer`] to the submission closure, and
//! parks the calling thread until the completer fires.
//!
//! The cell is checked under its mutex before parking, so a completion that
//! fires before `await_once` reaches the wait is never missed. Cells are never
//! reused; each call allocates its own.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::VmnetError;

enum Slot<T> {
    Pending,
    Ready(T),
    Abandoned,
    Taken,
}

struct Cell<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Cell<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, value: Slot<T>) {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = value;
            self.ready.notify_one();
        }
    }
}

/// The sending half of a one-shot completion.
///
/// Consumed by [`complete`](Self::complete), so it can fire at most once.
/// Dropping it without completing wakes the waiter with
/// [`VmnetError::CompletionAbandoned`].
pub struct Completer<T> {
    cell: Option<Arc<Cell<T>>>,
}

impl<T> Completer<T> {
    /// Delivers the result to the waiting caller.
    pub fn complete(mut self, value: T) {
        if let Some(cell) = self.cell.take() {
            cell.settle(Slot::Ready(value));
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            cell.settle(Slot::Abandoned);
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("armed", &self.cell.is_some())
            .finish()
    }
}

/// Submits an asynchronous command and blocks until its completion fires.
///
/// `submit` receives the [`Completer`] and must arrange for the host to call
/// it exactly once. If `submit` itself fails the error is returned at once
/// without waiting; a completer it already passed on may still fire later and
/// is silently discarded.
///
/// Must not be called from the delivery context that is expected to run the
/// completion, or the call deadlocks.
///
/// # Errors
///
/// Returns the submission error, or [`VmnetError::CompletionAbandoned`] if
/// the completer is dropped without being completed.
pub fn await_once<T, E, F>(submit: F) -> Result<T, E>
where
    F: FnOnce(Completer<T>) -> Result<(), E>,
    E: From<VmnetError>,
{
    let cell = Arc::new(Cell {
        slot: Mutex::new(Slot::Pending),
        ready: Condvar::new(),
    });

    submit(Completer {
        cell: Some(Arc::clone(&cell)),
    })?;

    let mut slot = cell.lock();
    while matches!(*slot, Slot::Pending) {
        slot = cell.ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
    }

    match std::mem::replace(&mut *slot, Slot::Taken) {
        Slot::Ready(value) => Ok(value),
        Slot::Abandoned | Slot::Pending | Slot::Taken => {
            Err(VmnetError::CompletionAbandoned.into())
        }
    }
}
