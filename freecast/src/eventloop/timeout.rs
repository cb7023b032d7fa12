//! Delayed and periodic callables, ordered by next fire time.
//!
//! The heap is a min-heap keyed by `(fire_at, seq)`; the sequence counter
//! keeps FIFO ordering among timeouts due at the same instant. Cancellation
//! is a flag on shared state: the loop re-checks it immediately before
//! invocation, so a timeout cancelled after being popped still never fires.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

/// Shared state between a heap entry and its [`TimeoutHandle`].
#[derive(Debug)]
pub(crate) struct TimeoutState {
    label: String,
    cancelled: AtomicBool,
}

impl TimeoutState {
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

/// Handle returned by timeout scheduling, used to cancel before firing.
///
/// Cloneable; all clones control the same timeout. Cancelling is idempotent
/// and safe from any thread.
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    state: Arc<TimeoutState>,
}

impl TimeoutHandle {
    /// Prevents the timeout's callable from ever being invoked again.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, AtomicOrdering::Release);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

/// One pending timeout.
pub(crate) struct TimeoutEntry {
    pub(crate) fire_at: Duration,
    seq: u64,
    pub(crate) interval: Option<Duration>,
    pub(crate) callable: Box<dyn FnMut() + Send>,
    pub(crate) state: Arc<TimeoutState>,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    // Reversed so the BinaryHeap behaves as a min-heap on (fire_at, seq).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending timeouts ordered by next fire time.
pub(crate) struct TimeoutHeap {
    heap: BinaryHeap<TimeoutEntry>,
    next_seq: u64,
}

impl TimeoutHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Inserts a timeout firing at `fire_at`, returning its cancel handle.
    pub(crate) fn insert(
        &mut self,
        fire_at: Duration,
        interval: Option<Duration>,
        label: impl Into<String>,
        callable: Box<dyn FnMut() + Send>,
    ) -> TimeoutHandle {
        let state = Arc::new(TimeoutState {
            label: label.into(),
            cancelled: AtomicBool::new(false),
        });
        let handle = TimeoutHandle {
            state: Arc::clone(&state),
        };
        let seq = self.bump_seq();
        self.heap.push(TimeoutEntry {
            fire_at,
            seq,
            interval,
            callable,
            state,
        });
        handle
    }

    /// Puts a repeating entry back with its advanced fire time.
    pub(crate) fn reinsert(&mut self, mut entry: TimeoutEntry) {
        entry.seq = self.bump_seq();
        self.heap.push(entry);
    }

    /// Pops the earliest entry whose fire time has arrived.
    pub(crate) fn pop_due(&mut self, now: Duration) -> Option<TimeoutEntry> {
        if self.heap.peek().is_some_and(|entry| entry.fire_at <= now) {
            self.heap.pop()
        } else {
            None
        }
    }

    /// Returns the earliest pending fire time, cancelled entries included.
    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        self.heap.peek().map(|entry| entry.fire_at)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Box<dyn FnMut() + Send> {
        Box::new(|| {})
    }

    #[test]
    fn pops_in_fire_time_order() {
        let mut heap = TimeoutHeap::new();
        heap.insert(Duration::from_millis(30), None, "c", noop());
        heap.insert(Duration::from_millis(10), None, "a", noop());
        heap.insert(Duration::from_millis(20), None, "b", noop());

        let now = Duration::from_millis(100);
        assert_eq!(heap.pop_due(now).unwrap().state.label(), "a");
        assert_eq!(heap.pop_due(now).unwrap().state.label(), "b");
        assert_eq!(heap.pop_due(now).unwrap().state.label(), "c");
        assert!(heap.pop_due(now).is_none());
    }

    #[test]
    fn equal_fire_times_pop_in_insertion_order() {
        let mut heap = TimeoutHeap::new();
        let at = Duration::from_millis(10);
        heap.insert(at, None, "first", noop());
        heap.insert(at, None, "second", noop());

        assert_eq!(heap.pop_due(at).unwrap().state.label(), "first");
        assert_eq!(heap.pop_due(at).unwrap().state.label(), "second");
    }

    #[test]
    fn not_due_entries_stay_put() {
        let mut heap = TimeoutHeap::new();
        heap.insert(Duration::from_millis(50), None, "later", noop());
        assert!(heap.pop_due(Duration::from_millis(10)).is_none());
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.next_deadline(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn cancelled_flag_is_visible_through_entry() {
        let mut heap = TimeoutHeap::new();
        let handle = heap.insert(Duration::from_millis(1), None, "t", noop());
        handle.cancel();

        let entry = heap.pop_due(Duration::from_millis(5)).unwrap();
        assert!(entry.state.is_cancelled());
    }
}
