//! Coalesced "packets available" notifications.
//!
//! The host raises a packets-available event on its delivery context every
//! time inbound traffic is queued. [`EventBridge`] folds those events into a
//! level a blocking consumer can wait on: the delivery side bumps a counter
//! and broadcasts, the consumer parks until the counter moves past the value
//! it last observed.
//!
//! Any number of events between two waits collapse into one wakeup. A wakeup
//! says nothing about how many packets are queued, or whether any still are,
//! so consumers must drain with non-blocking reads until the queue is empty.
//!
//! Closing the bridge wakes every waiter for good; see [`EventBridge::close`].

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, VmnetError};

#[derive(Debug, Default)]
struct Counters {
    /// Events delivered so far. Only ever increases.
    event_count: u64,
    /// `event_count` as of the last completed wait. Never exceeds it.
    last_seen: u64,
    /// Set once the interface stops. Never cleared.
    closed: bool,
}

/// Edge-triggered, coalescing wakeup channel.
#[derive(Debug, Default)]
pub struct EventBridge {
    counters: Mutex<Counters>,
    signal: Condvar,
}

impl EventBridge {
    /// Creates a bridge with no pending events.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one delivery and wakes every waiter.
    ///
    /// Called from the host's delivery context.
    pub fn notify(&self) {
        let mut counters = self.lock();
        counters.event_count = counters.event_count.wrapping_add(1);
        tracing::trace!(event_count = counters.event_count, "packets available");
        self.signal.notify_all();
    }

    /// Blocks until at least one event arrived since the previous wait.
    ///
    /// Returns immediately if events are already pending. There is no timeout;
    /// the only way out other than an event is [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Returns [`VmnetError::Stopped`] once the bridge is closed, including
    /// for waits already parked when it closes.
    pub fn wait(&self) -> Result<()> {
        let mut counters = self.lock();
        while !counters.closed && counters.event_count == counters.last_seen {
            counters = self
                .signal
                .wait(counters)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if counters.closed {
            return Err(VmnetError::Stopped);
        }
        counters.last_seen = counters.event_count;
        Ok(())
    }

    /// Closes the bridge and wakes every waiter.
    ///
    /// Idempotent. Later notifications are still counted but no wait
    /// succeeds again.
    pub fn close(&self) {
        let mut counters = self.lock();
        counters.closed = true;
        self.signal.notify_all();
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Returns true if events arrived since the previous [`wait`](Self::wait).
    #[must_use]
    pub fn has_pending(&self) -> bool {
        let counters = self.lock();
        counters.event_count != counters.last_seen
    }

    /// Returns the number of events delivered so far.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.lock().event_count
    }
}
