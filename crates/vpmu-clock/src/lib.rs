//! Virtual time source and deadline queue for deterministic device emulation.
//!
//! Emulated devices in this workspace never read host wall time. Instead the
//! embedder (the vCPU run loop) owns a [`VirtualClock`] that advances only
//! when the embedder decides, and a [`TimerQueue`] holding absolute-deadline
//! timers that the loop polls between guest entries. Both are plain data:
//! snapshotting them and restoring on another host reproduces the exact same
//! future timer firings.
//!
//! # Model
//!
//! - [`VirtualClock`] — a monotonic nanosecond counter. `advance()` is the
//!   only way it moves.
//! - [`TimerQueue`] — schedule/cancel of timers identified by a [`TimerId`].
//!   Ids are never reused, so a stale id held after a cancel or a pop can
//!   never alias a newer timer.
//!
//! The queue does not invoke callbacks. The run loop calls
//! [`TimerQueue::pop_expired`] and dispatches the returned ids itself, which
//! keeps every timer action on the vCPU's own execution context.

use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Monotonic virtual clock, in nanoseconds.
///
/// The embedder advances it after each batch of emulated work. Devices only
/// ever observe `now_ns()`; none of them can move time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualClock {
    now_ns: u64,
}

impl VirtualClock {
    /// Create a clock at t=0.
    pub fn new() -> Self {
        Self { now_ns: 0 }
    }

    /// Recreate a clock at an arbitrary instant (snapshot restore).
    pub fn from_ns(now_ns: u64) -> Self {
        Self { now_ns }
    }

    /// Current virtual time in nanoseconds.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Advance the clock by `delta_ns`. Saturates instead of wrapping.
    #[inline]
    pub fn advance(&mut self, delta_ns: u64) {
        self.now_ns = self.now_ns.saturating_add(delta_ns);
    }
}

/// Opaque identity of a scheduled timer.
///
/// Ids are allocated from a monotonic counter and never reused for the
/// lifetime of the queue (including across snapshot/restore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(u64);

impl TimerId {
    /// Raw id value, for logging.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Deadline queue for virtual-time timers.
///
/// Holds at most a handful of timers per device instance, so the armed set
/// is kept in a `BTreeMap` keyed by id: iteration order is deterministic
/// and cancellation is a plain removal.
#[derive(Debug, Clone, Default)]
pub struct TimerQueue {
    next_id: u64,
    /// Armed timers: id → absolute deadline in ns.
    armed: BTreeMap<u64, u64>,
}

impl TimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer at the absolute virtual instant `deadline_ns`.
    ///
    /// A deadline at or before "now" is legal; the timer is simply returned
    /// by the next `pop_expired` call.
    pub fn schedule(&mut self, deadline_ns: u64) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.armed.insert(id.0, deadline_ns);
        trace!("timer {} armed for t={}ns", id.raw(), deadline_ns);
        id
    }

    /// Cancel a timer. Returns `false` if the id was already popped or
    /// cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let was_armed = self.armed.remove(&id.0).is_some();
        if was_armed {
            trace!("timer {} cancelled", id.raw());
        }
        was_armed
    }

    /// Whether `id` is still armed.
    #[inline]
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id.0)
    }

    /// Deadline of the soonest armed timer, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.armed.values().copied().min()
    }

    /// Remove and return every timer with `deadline <= now_ns`, ordered by
    /// (deadline, id). The caller dispatches the ids.
    pub fn pop_expired(&mut self, now_ns: u64) -> Vec<TimerId> {
        let mut due: Vec<(u64, u64)> = self
            .armed
            .iter()
            .filter(|(_, &deadline)| deadline <= now_ns)
            .map(|(&id, &deadline)| (deadline, id))
            .collect();
        due.sort_unstable();

        for &(_, id) in &due {
            self.armed.remove(&id);
        }
        due.into_iter().map(|(_, id)| TimerId(id)).collect()
    }

    /// Number of armed timers.
    #[inline]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// True if no timer is armed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Produce a serialisable snapshot of the armed set and id counter.
    pub fn snapshot(&self) -> TimerQueueSnapshot {
        TimerQueueSnapshot {
            next_id: self.next_id,
            armed: self.armed.iter().map(|(&id, &dl)| (id, dl)).collect(),
        }
    }

    /// Restore a queue from a snapshot.
    pub fn restore(snapshot: &TimerQueueSnapshot) -> Self {
        Self {
            next_id: snapshot.next_id,
            armed: snapshot.armed.iter().copied().collect(),
        }
    }
}

/// Serialisable queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerQueueSnapshot {
    /// Next id to allocate.
    pub next_id: u64,
    /// Armed (id, deadline) pairs.
    pub armed: Vec<(u64, u64)>,
}
