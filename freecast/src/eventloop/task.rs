//! Pending-task queues.
//!
//! Two instances exist per loop: *urgent* and *idle*. The urgent queue always
//! drains fully before any idle item runs; idle items run one per scheduler
//! pass. Each queue is protected by its own lock, and the lock is never held
//! while a task executes.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A scheduled unit of work. Runs at most once.
pub(crate) struct Task {
    pub(crate) label: String,
    pub(crate) callable: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub(crate) fn new(label: impl Into<String>, f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            callable: Box::new(f),
        }
    }
}

/// FIFO queue of pending tasks, safe to feed from any thread.
pub(crate) struct TaskQueue {
    inner: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        self.inner.lock().unwrap().push_back(task);
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.inner.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards all pending tasks, returning how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut queue = self.inner.lock().unwrap();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}
