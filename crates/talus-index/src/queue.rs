//! FIFO queue with in-band drain barriers, safe for concurrent access.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct BarrierState {
    done: Mutex<Option<bool>>,
    signal: Condvar,
}

impl BarrierState {
    fn fulfill(&self, value: bool) {
        let mut done = self.done.lock();
        if done.is_none() {
            *done = Some(value);
        }
        self.signal.notify_all();
    }
}

/// Handle to a queued barrier; resolves once every element queued ahead of
/// it has been popped.
pub struct Barrier {
    state: Arc<BarrierState>,
}

impl Barrier {
    /// Block until the barrier resolves. Returns `true` if the queue
    /// drained past it, `false` if the queue was interrupted first.
    pub fn wait(&self) -> bool {
        let mut done = self.state.done.lock();
        while done.is_none() {
            self.state.signal.wait(&mut done);
        }
        done.expect("loop exits only when resolved")
    }
}

enum QueueEntry<T> {
    Item(T),
    Barrier(Arc<BarrierState>),
}

/// A FIFO of items interleaved with drain barriers.
///
/// Barriers travel in-band, so "everything queued up to now has been
/// processed" has a total order with real work rather than relying on a
/// side channel.
pub struct Queue<T> {
    queue: Mutex<VecDeque<QueueEntry<T>>>,
    signal: Condvar,
    interrupted: AtomicBool,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Append an item and wake poppers.
    pub fn push(&self, item: T) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(QueueEntry::Item(item));
        }
        self.signal.notify_all();
    }

    /// Pop the next item, fulfilling any barriers passed on the way.
    ///
    /// Blocks while the queue is empty; returns `None` once interrupted.
    pub fn pop(&self) -> Option<T> {
        let mut queue = self.queue.lock();
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                return None;
            }
            match queue.pop_front() {
                Some(QueueEntry::Item(item)) => return Some(item),
                Some(QueueEntry::Barrier(state)) => state.fulfill(true),
                None => self.signal.wait(&mut queue),
            }
        }
    }

    /// Enqueue a barrier resolving once all elements currently in the
    /// queue have been popped off.
    pub fn wait_until_processed(&self) -> Barrier {
        let state = Arc::new(BarrierState {
            done: Mutex::new(None),
            signal: Condvar::new(),
        });
        {
            let mut queue = self.queue.lock();
            if self.interrupted.load(Ordering::SeqCst) {
                // Nothing will drain an interrupted queue.
                state.fulfill(false);
            } else {
                queue.push_back(QueueEntry::Barrier(state.clone()));
            }
        }
        self.signal.notify_all();
        Barrier { state }
    }

    /// Interrupt all blocking pops, resolving still-queued barriers to the
    /// interrupted value.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        {
            let mut queue = self.queue.lock();
            queue.retain(|entry| match entry {
                QueueEntry::Item(_) => true,
                QueueEntry::Barrier(state) => {
                    state.fulfill(false);
                    false
                }
            });
        }
        self.signal.notify_all();
    }
}
