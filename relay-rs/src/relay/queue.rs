//! Bounded blocking work queue shared by the scanner and the workers
//!
//! ```text
//! ┌─────────┐  push   ┌───────────────┐  pop   ┌──────────┐
//! │ Scanner │ ──────→ │ WorkQueue<T>  │ ─────→ │ Worker×N │
//! └─────────┘         │ items + claims│ ←───── └──────────┘
//!                     └───────────────┘ complete
//! ```
//!
//! An item stays *claimed* from the moment it is pushed until the worker
//! that popped it calls [`WorkQueue::complete`]. Pushing a claimed item
//! again is a no-op, so the scanner can sweep the work directory without
//! handing the same file to two workers.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Result of [`WorkQueue::push`]
#[derive(Debug, PartialEq, Eq)]
pub enum Push<T> {
    Queued,
    /// Already queued or being processed
    Duplicate,
    /// The queue was stopped; the item is handed back
    Stopped(T),
}

struct State<T> {
    items: VecDeque<T>,
    claimed: HashSet<T>,
    stopped: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    stop_signal: Condvar,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                claimed: HashSet::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            stop_signal: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue `item`, blocking while the queue is full
    pub fn push(&self, item: T) -> Push<T> {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return Push::Stopped(item);
            }
            if state.claimed.contains(&item) {
                return Push::Duplicate;
            }
            if state.items.len() < self.capacity {
                break;
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        state.claimed.insert(item.clone());
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Push::Queued
    }

    /// Block until an item is available; `None` once the queue is stopped
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Release the claim on an item returned by [`WorkQueue::pop`]
    pub fn complete(&self, item: &T) {
        self.lock().claimed.remove(item);
    }

    pub fn is_claimed(&self, item: &T) -> bool {
        self.lock().claimed.contains(item)
    }

    /// Items waiting to be popped
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every blocked producer and consumer; later pushes are refused
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.stop_signal.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Sleep for up to `timeout`, returning early with `true` if stopped
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .stop_signal
            .wait_timeout_while(state, timeout, |s| !s.stopped)
            .unwrap_or_else(PoisonError::into_inner);
        state.stopped
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new(8);
        assert_eq!(queue.push(1), Push::Queued);
        assert_eq!(queue.push(2), Push::Queued);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_claimed_items_are_not_duplicated() {
        let queue = WorkQueue::new(8);
        assert_eq!(queue.push("a"), Push::Queued);
        assert_eq!(queue.push("a"), Push::Duplicate);

        let item = queue.pop().unwrap();
        // Still claimed while the worker holds it
        assert_eq!(queue.push("a"), Push::Duplicate);
        queue.complete(&item);
        assert_eq!(queue.push("a"), Push::Queued);
    }

    #[test]
    fn test_stop_wakes_blocked_consumer() {
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(4));
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.stop();
        assert_eq!(worker.join().unwrap(), None);
        assert_eq!(queue.push(7), Push::Stopped(7));
    }

    #[test]
    fn test_push_blocks_when_full() {
        let queue = Arc::new(WorkQueue::new(1));
        assert_eq!(queue.push(1), Push::Queued);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(producer.join().unwrap(), Push::Queued);
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_wait_stopped() {
        let queue: WorkQueue<u32> = WorkQueue::new(1);
        assert!(!queue.wait_stopped(Duration::from_millis(10)));
        queue.stop();
        assert!(queue.wait_stopped(Duration::from_secs(5)));
    }
}
