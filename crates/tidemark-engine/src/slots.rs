//! Global run slots with priority dispatch.
//!
//! A plain semaphore wakes waiters in FIFO order; the scheduler instead
//! needs the highest-priority queued run to win the next free slot, with
//! FIFO only as the tie-break. Waiters park on a oneshot and releases hand
//! the permit itself through the channel, so a waiter dropped after
//! dispatch drops the permit and the slot goes back into circulation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<SlotPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence (older) first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Inner {
    available: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

/// Counted run slots where releases dispatch to the highest-priority
/// waiter instead of the oldest.
pub struct PrioritySlots {
    inner: Mutex<Inner>,
}

impl PrioritySlots {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                available: capacity,
                next_seq: 0,
                waiters: BinaryHeap::new(),
            }),
        })
    }

    /// Acquire one slot, parking until dispatched. Equal priorities are
    /// served in arrival order.
    pub async fn acquire_owned(self: Arc<Self>, priority: i32) -> SlotPermit {
        let rx = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.available > 0 {
                inner.available -= 1;
                drop(inner);
                return SlotPermit { slots: Some(self) };
            }
            let (tx, rx) = oneshot::channel();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.waiters.push(Waiter { priority, seq, tx });
            rx
        };
        match rx.await {
            Ok(permit) => permit,
            // The sender lives in the waiter heap, which lives as long as
            // the Arc held here; a dispatch always delivers the permit.
            Err(_) => SlotPermit { slots: Some(self) },
        }
    }

    fn release(this: &Arc<Self>) {
        let mut inner = this.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Skip waiters whose acquire future was already cancelled.
        while let Some(waiter) = inner.waiters.pop() {
            let permit = SlotPermit {
                slots: Some(Arc::clone(this)),
            };
            match waiter.tx.send(permit) {
                Ok(()) => return,
                Err(mut bounced) => {
                    // Defuse the rejected permit so its drop does not
                    // re-enter release under the lock.
                    bounced.slots = None;
                }
            }
        }
        inner.available += 1;
    }
}

/// Held slot; releasing happens on drop. Dropping an undelivered permit
/// (the receiving acquire future was cancelled) releases the slot too.
pub struct SlotPermit {
    slots: Option<Arc<PrioritySlots>>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.take() {
            PrioritySlots::release(&slots);
        }
    }
}
