// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity, back-pressured FIFO of paths awaiting a scan.
//!
//! `submit` blocks the caller while the queue is full rather than dropping
//! the newest or oldest item — silent drop under load is a malware-evasion
//! vector, so a full queue stalls the ingestor instead of losing events.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

/// Outcome of a `submit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    ShuttingDown,
}

struct State {
    items: VecDeque<PathBuf>,
    capacity: usize,
    shutting_down: bool,
}

/// The bounded work queue (C3).
pub struct WorkQueue {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl WorkQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                capacity,
                shutting_down: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue `path`, blocking while the queue is full. Returns
    /// `ShuttingDown` without enqueuing if shutdown has already begun.
    pub fn submit(&self, path: PathBuf) -> SubmitOutcome {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutting_down {
                return SubmitOutcome::ShuttingDown;
            }
            if state.items.len() < state.capacity {
                state.items.push_back(path);
                drop(state);
                self.not_empty.notify_one();
                return SubmitOutcome::Accepted;
            }
            state = self.not_full.wait(state).unwrap();
        }
    }

    /// Block until an item is available or the queue has drained after
    /// shutdown, in which case `None` is returned.
    pub fn take(&self) -> Option<PathBuf> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.shutting_down {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Approximate current depth, for observability only.
    pub fn depth(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Signal shutdown: wake every blocked producer and worker. Producers
    /// still inside `submit` observe `ShuttingDown`; workers drain any
    /// remaining items before `take` starts returning `None`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutting_down = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = WorkQueue::new(4);
        queue.submit(PathBuf::from("/a"));
        queue.submit(PathBuf::from("/b"));
        queue.submit(PathBuf::from("/c"));
        assert_eq!(queue.take(), Some(PathBuf::from("/a")));
        assert_eq!(queue.take(), Some(PathBuf::from("/b")));
        assert_eq!(queue.take(), Some(PathBuf::from("/c")));
    }

    #[test]
    fn submit_blocks_when_full_until_drained() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.submit(PathBuf::from("/first"));

        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            producer_queue.submit(PathBuf::from("/second"));
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.depth(), 1, "second submit should still be blocked");

        assert_eq!(queue.take(), Some(PathBuf::from("/first")));
        producer.join().unwrap();
        assert_eq!(queue.take(), Some(PathBuf::from("/second")));
    }

    #[test]
    fn shutdown_wakes_blocked_producer_without_enqueuing() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.submit(PathBuf::from("/first"));

        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || producer_queue.submit(PathBuf::from("/second")));

        thread::sleep(Duration::from_millis(50));
        queue.shutdown();
        let outcome = producer.join().unwrap();
        assert_eq!(outcome, SubmitOutcome::ShuttingDown);
    }

    #[test]
    fn take_drains_before_returning_none_after_shutdown() {
        let queue = WorkQueue::new(4);
        queue.submit(PathBuf::from("/a"));
        queue.shutdown();
        assert_eq!(queue.take(), Some(PathBuf::from("/a")));
        assert_eq!(queue.take(), None);
    }
}
